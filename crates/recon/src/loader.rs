use std::collections::HashMap;

use crate::config::SourceConfig;
use crate::error::ReconError;
use crate::model::{ItemStatus, MatchableItem};

/// Load CSV rows into unmatched items for `source_id`, applying the column
/// mapping. Every column (mapped or not) is kept in `attributes`.
pub fn load_csv_items(
    source_id: &str,
    csv_data: &str,
    source: &SourceConfig,
) -> Result<Vec<MatchableItem>, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ReconError::Io(e.to_string()))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let col = &source.columns;

    let idx = |name: &str| -> Result<usize, ReconError> {
        headers.iter().position(|h| h == name).ok_or_else(|| ReconError::MissingColumn {
            source: source_id.into(),
            column: name.into(),
        })
    };

    let id_idx = idx(&col.id)?;
    let amount_idx = idx(&col.amount)?;
    let date_idx = idx(&col.date)?;
    let label_idx = idx(&col.label)?;
    let owner_idx = match &col.owner {
        Some(name) => Some(idx(name)?),
        None => None,
    };

    if owner_idx.is_none() && source.owner.is_none() {
        return Err(ReconError::Configuration(format!(
            "source '{source_id}': needs either an owner column or a default owner"
        )));
    }

    let mut items = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|e| ReconError::Io(e.to_string()))?;

        let id = record.get(id_idx).unwrap_or("").to_string();
        let label = record.get(label_idx).unwrap_or("").to_string();

        let owner = match owner_idx {
            Some(oi) => record.get(oi).unwrap_or("").to_string(),
            None => source.owner.clone().unwrap_or_default(),
        };

        let date_str = record.get(date_idx).unwrap_or("");
        let date = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d").map_err(|_| {
            ReconError::DateParse {
                source: source_id.into(),
                item_id: id.clone(),
                value: date_str.into(),
            }
        })?;

        let amount_str = record.get(amount_idx).unwrap_or("");
        let amount_minor: i64 = amount_str.parse().map_err(|_| ReconError::AmountParse {
            source: source_id.into(),
            item_id: id.clone(),
            value: amount_str.into(),
        })?;

        let mut attributes = HashMap::new();
        for (i, h) in headers.iter().enumerate() {
            if let Some(val) = record.get(i) {
                attributes.insert(h.clone(), val.to_string());
            }
        }

        items.push(MatchableItem {
            id,
            source_id: source_id.into(),
            owner,
            amount_minor,
            date,
            label,
            attributes,
            status: ItemStatus::Unmatched,
        });
    }

    Ok(items)
}
