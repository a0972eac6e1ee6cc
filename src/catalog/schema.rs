use serde::{Deserialize, Serialize};

use crate::error::{EntityKind, StoreError};

/// Hidden physical-address column appended to every finalized schema.
pub const PHY_ADDR_COLUMN: &str = "__phy_addr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float64,
    Decimal128,
    Varchar,
    Blob,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
    #[serde(default)]
    pub default_expr: Option<String>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub hidden: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            nullable: true,
            default_expr: None,
            comment: String::new(),
            primary: false,
            hidden: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Ordered column layout of a table. Append-only while under
/// construction; `finalize` validates, appends the hidden physical
/// address column, and freezes the layout. DDL after that point goes
/// through the `with_*` constructors, which produce the next schema
/// version for a fresh MVCC node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<usize>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    finalized: bool,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            comment: String::new(),
            finalized: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn add_column(&mut self, def: ColumnDef) -> Result<&mut Self, StoreError> {
        if self.finalized {
            return Err(StoreError::NotPermitted(format!(
                "schema '{}' is finalized",
                self.name
            )));
        }
        if self.column(&def.name).is_some() {
            return Err(StoreError::Duplicate {
                entity: EntityKind::Column,
                name: def.name,
            });
        }
        if def.primary {
            self.primary_key.push(self.columns.len());
        }
        self.columns.push(def);
        Ok(self)
    }

    pub fn finalize(&mut self) -> Result<(), StoreError> {
        if self.finalized {
            return Ok(());
        }
        if self.name.is_empty() {
            return Err(StoreError::InvalidRequest("table name is empty".into()));
        }
        if self.columns.is_empty() {
            return Err(StoreError::InvalidRequest(format!(
                "table '{}' has no columns",
                self.name
            )));
        }
        self.columns.push(ColumnDef {
            name: PHY_ADDR_COLUMN.to_string(),
            col_type: ColumnType::Blob,
            nullable: false,
            default_expr: None,
            comment: String::new(),
            primary: false,
            hidden: true,
        });
        self.finalized = true;
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<(usize, &ColumnDef)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }

    pub fn visible_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| !c.hidden)
    }

    pub fn primary_key_columns(&self) -> Vec<&ColumnDef> {
        self.primary_key
            .iter()
            .filter_map(|&i| self.columns.get(i))
            .collect()
    }

    fn ensure_finalized(&self) -> Result<(), StoreError> {
        if !self.finalized {
            return Err(StoreError::Internal(format!(
                "schema '{}' used before finalize",
                self.name
            )));
        }
        Ok(())
    }

    pub fn with_added_column(&self, def: ColumnDef) -> Result<TableSchema, StoreError> {
        self.ensure_finalized()?;
        if self.column(&def.name).is_some() {
            return Err(StoreError::Duplicate {
                entity: EntityKind::Column,
                name: def.name,
            });
        }
        if def.primary {
            return Err(StoreError::NotPermitted(
                "cannot add a primary-key column to an existing table".into(),
            ));
        }
        let mut next = self.clone();
        // New columns land before the hidden physical-address tail.
        let at = next.columns.len() - 1;
        next.columns.insert(at, def);
        for pk in &mut next.primary_key {
            if *pk >= at {
                *pk += 1;
            }
        }
        Ok(next)
    }

    pub fn with_dropped_column(&self, name: &str) -> Result<TableSchema, StoreError> {
        self.ensure_finalized()?;
        let (idx, def) = self.column(name).ok_or_else(|| StoreError::NotFound {
            entity: EntityKind::Column,
            name: name.to_string(),
        })?;
        if def.hidden {
            return Err(StoreError::NotPermitted(format!(
                "column '{name}' is internal"
            )));
        }
        if self.primary_key.contains(&idx) {
            return Err(StoreError::NotPermitted(format!(
                "column '{name}' is part of the primary key"
            )));
        }
        if self.indexes.iter().any(|ix| ix.columns.iter().any(|c| c == name)) {
            return Err(StoreError::NotPermitted(format!(
                "column '{name}' is indexed"
            )));
        }
        let mut next = self.clone();
        next.columns.remove(idx);
        for pk in &mut next.primary_key {
            if *pk > idx {
                *pk -= 1;
            }
        }
        Ok(next)
    }

    pub fn with_comment(&self, comment: impl Into<String>) -> Result<TableSchema, StoreError> {
        self.ensure_finalized()?;
        let mut next = self.clone();
        next.comment = comment.into();
        Ok(next)
    }

    pub fn with_index(&self, index: IndexDef) -> Result<TableSchema, StoreError> {
        self.ensure_finalized()?;
        if self.indexes.iter().any(|ix| ix.name == index.name) {
            return Err(StoreError::Duplicate {
                entity: EntityKind::Index,
                name: index.name,
            });
        }
        for col in &index.columns {
            if self.column(col).is_none() {
                return Err(StoreError::NotFound {
                    entity: EntityKind::Column,
                    name: col.clone(),
                });
            }
        }
        let mut next = self.clone();
        next.indexes.push(index);
        Ok(next)
    }

    pub fn without_index(&self, name: &str) -> Result<TableSchema, StoreError> {
        self.ensure_finalized()?;
        let pos = self
            .indexes
            .iter()
            .position(|ix| ix.name == name)
            .ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Index,
                name: name.to_string(),
            })?;
        let mut next = self.clone();
        next.indexes.remove(pos);
        Ok(next)
    }

    pub fn with_primary_key(&self, columns: &[String]) -> Result<TableSchema, StoreError> {
        self.ensure_finalized()?;
        if columns.is_empty() {
            return Err(StoreError::InvalidRequest("empty primary key".into()));
        }
        let mut next = self.clone();
        next.primary_key.clear();
        for name in columns {
            let (idx, def) = self.column(name).ok_or_else(|| StoreError::NotFound {
                entity: EntityKind::Column,
                name: name.clone(),
            })?;
            if def.hidden {
                return Err(StoreError::NotPermitted(format!(
                    "column '{name}' is internal"
                )));
            }
            next.primary_key.push(idx);
        }
        for (idx, col) in next.columns.iter_mut().enumerate() {
            col.primary = next.primary_key.contains(&idx);
            if col.primary {
                col.nullable = false;
            }
        }
        Ok(next)
    }
}
