//! Per-cell parameter values for deferred cell properties

use super::Cell;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Values of cell properties, looked up when properties are resolved
///
/// ```ignore
/// let mut params = ParameterTable::new();
/// params.set(q0, "rec_offset", 120e-9);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterTable {
    cells: BTreeMap<usize, BTreeMap<String, f64>>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, cell: Cell, name: impl Into<String>, value: f64) -> &mut Self {
        self.cells
            .entry(cell.index())
            .or_default()
            .insert(name.into(), value);
        self
    }

    pub fn get(&self, cell: Cell, name: &str) -> Option<f64> {
        self.cells.get(&cell.index())?.get(name).copied()
    }

    /// Like [`get`](Self::get) but a missing entry is an error
    pub fn lookup(&self, cell: Cell, name: &str) -> Result<f64> {
        self.get(cell, name).ok_or_else(|| Error::MissingProperty {
            cell: cell.index(),
            name: name.to_string(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::structural(format!("Invalid parameter table: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let mut table = ParameterTable::new();
        table.set(Cell::new(1), "rec_offset", 120e-9);

        assert_eq!(table.get(Cell::new(1), "rec_offset"), Some(120e-9));
        assert_eq!(
            table.lookup(Cell::new(0), "rec_offset"),
            Err(Error::MissingProperty {
                cell: 0,
                name: "rec_offset".to_string()
            })
        );
    }

    #[test]
    fn test_from_json() {
        let table = ParameterTable::from_json(r#"{"cells": {"0": {"pi_len": 2.4e-8}}}"#).unwrap();
        assert_eq!(table.get(Cell::new(0), "pi_len"), Some(2.4e-8));
    }
}
