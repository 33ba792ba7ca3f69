//! Record-set container
//!
//! Just enough of a grid to carry watch and query results: meta, ordered
//! columns, and rows of optional cells.

use indexmap::IndexSet;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::{Dict, Val};

/// Grid format version written into the meta
const GRID_VERSION: &str = "3.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Col {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grid {
    meta: Dict,
    cols: Vec<Col>,
    rows: Vec<Vec<Option<Val>>>,
}

impl Grid {
    /// An empty grid carrying only meta
    pub fn empty(meta: Dict) -> Self {
        Self {
            meta,
            cols: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Build from a list of optional dicts.
    ///
    /// Columns are the union of tag names in first-seen order, `id` first
    /// when any row has one. A `None` entry becomes a row with every cell
    /// absent.
    pub fn from_dicts(meta: Dict, dicts: &[Option<Dict>]) -> Self {
        let mut names: IndexSet<&str> = IndexSet::new();
        if dicts.iter().flatten().any(|d| d.has("id")) {
            names.insert("id");
        }
        for dict in dicts.iter().flatten() {
            names.extend(dict.names());
        }

        let rows = dicts
            .iter()
            .map(|dict| match dict {
                Some(d) => names.iter().map(|n| d.get(n).cloned()).collect(),
                None => vec![None; names.len()],
            })
            .collect();
        let cols = names
            .into_iter()
            .map(|name| Col {
                name: name.to_string(),
            })
            .collect();

        Self { meta, cols, rows }
    }

    /// Build from dicts that are all present
    pub fn from_rows(meta: Dict, rows: Vec<Dict>) -> Self {
        let rows: Vec<Option<Dict>> = rows.into_iter().map(Some).collect();
        Self::from_dicts(meta, &rows)
    }

    pub fn meta(&self) -> &Dict {
        &self.meta
    }

    pub fn cols(&self) -> &[Col] {
        &self.cols
    }

    pub fn col_index(&self, name: &str) -> Option<usize> {
        self.cols.iter().position(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|cells| Row { grid: self, cells })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(|cells| Row { grid: self, cells })
    }
}

/// Borrowed view of one grid row
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    grid: &'a Grid,
    cells: &'a [Option<Val>],
}

impl<'a> Row<'a> {
    pub fn get(&self, name: &str) -> Option<&'a Val> {
        let idx = self.grid.col_index(name)?;
        self.cells.get(idx).and_then(Option::as_ref)
    }

    /// True when every cell is absent
    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }

    pub fn to_dict(&self) -> Dict {
        self.grid
            .cols
            .iter()
            .zip(self.cells)
            .filter_map(|(col, cell)| cell.clone().map(|v| (col.name.clone(), v)))
            .collect()
    }
}

// ============ JSON ============

struct MetaJson<'a>(&'a Dict);

impl Serialize for MetaJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len() + 1))?;
        map.serialize_entry("ver", GRID_VERSION)?;
        for (name, val) in self.0.iter() {
            map.serialize_entry(name, val)?;
        }
        map.end()
    }
}

struct ColsJson<'a>(&'a [Col]);

impl Serialize for ColsJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct NameOnly<'a> {
            name: &'a str,
        }

        if self.0.is_empty() {
            return [NameOnly { name: "empty" }].serialize(serializer);
        }
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for col in self.0 {
            seq.serialize_element(&NameOnly { name: &col.name })?;
        }
        seq.end()
    }
}

struct RowsJson<'a>(&'a Grid);

impl Serialize for RowsJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for row in self.0.rows() {
            seq.serialize_element(&row.to_dict())?;
        }
        seq.end()
    }
}

impl Serialize for Grid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("meta", &MetaJson(&self.meta))?;
        map.serialize_entry("cols", &ColsJson(&self.cols))?;
        map.serialize_entry("rows", &RowsJson(self))?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Num, Ref, dict};

    fn ahu() -> Dict {
        dict! { "dis" => "AHU", "id" => Ref::new("ahu").unwrap(), "equip" => Val::Marker }
    }

    #[test]
    fn id_column_first_and_union_of_names() {
        let point = dict! { "id" => Ref::new("p").unwrap(), "curVal" => Num::new(3.0) };
        let grid = Grid::from_dicts(Dict::new(), &[Some(ahu()), None, Some(point)]);

        let names: Vec<_> = grid.cols().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "dis", "equip", "curVal"]);
        assert_eq!(grid.len(), 3);

        let first = grid.row(0).unwrap();
        assert_eq!(first.get("dis"), Some(&Val::from("AHU")));
        assert_eq!(first.get("curVal"), None);

        let missing = grid.row(1).unwrap();
        assert!(missing.is_empty());
        assert_eq!(missing.get("id"), None);
    }

    #[test]
    fn serializes_haystack_json() {
        let mut meta = Dict::new();
        meta.set("watchId", "w-1");
        let grid = Grid::from_dicts(meta, &[Some(ahu()), None]);
        let json = serde_json::to_value(&grid).unwrap();
        assert_eq!(
            json,
            json!({
                "meta": {"ver": "3.0", "watchId": "w-1"},
                "cols": [{"name": "id"}, {"name": "dis"}, {"name": "equip"}],
                "rows": [{"id": "r:ahu", "dis": "AHU", "equip": "m:"}, {}],
            })
        );
    }

    #[test]
    fn empty_grid_has_placeholder_column() {
        let json = serde_json::to_value(Grid::empty(Dict::new())).unwrap();
        assert_eq!(json["cols"], json!([{"name": "empty"}]));
        assert_eq!(json["rows"], json!([]));
    }
}
