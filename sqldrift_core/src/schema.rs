use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Declared affinity of a column, as reported by the seed-database synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
}

impl ColumnType {
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Table and column metadata of one seed database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    tables: Vec<Table>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Tables the generator can reference: those with at least one column.
    pub fn usable_tables(&self) -> Vec<&Table> {
        self.tables.iter().filter(|t| !t.columns.is_empty()).collect()
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter().map(|c| c.name.as_str()))
    }

    /// Looks up the declared type of `column`, searching every table when no
    /// qualifier is given.
    pub fn column_type(&self, table: Option<&str>, column: &str) -> Option<ColumnType> {
        match table {
            Some(t) => self.table(t)?.column(column).map(|c| c.column_type),
            None => self
                .tables
                .iter()
                .find_map(|t| t.column(column))
                .map(|c| c.column_type),
        }
    }

    /// The four-table storefront layout used by the bundled sample configuration.
    pub fn storefront() -> Self {
        fn table(name: &str, columns: &[(&str, ColumnType)]) -> Table {
            Table {
                name: name.to_string(),
                columns: columns
                    .iter()
                    .map(|(n, t)| Column {
                        name: n.to_string(),
                        column_type: *t,
                    })
                    .collect(),
            }
        }
        use ColumnType::*;
        Self::new(vec![
            table(
                "users",
                &[
                    ("id", Integer),
                    ("name", Text),
                    ("email", Text),
                    ("age", Integer),
                    ("joined_date", Text),
                    ("score", Real),
                ],
            ),
            table(
                "products",
                &[
                    ("id", Integer),
                    ("name", Text),
                    ("price", Real),
                    ("category", Text),
                    ("stock", Integer),
                ],
            ),
            table(
                "orders",
                &[
                    ("id", Integer),
                    ("user_id", Integer),
                    ("product_id", Integer),
                    ("quantity", Integer),
                    ("order_date", Text),
                ],
            ),
            table(
                "reviews",
                &[
                    ("id", Integer),
                    ("user_id", Integer),
                    ("product_id", Integer),
                    ("rating", Integer),
                    ("comment", Text),
                ],
            ),
        ])
    }
}

/// A database snapshot file plus the schema it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SeedDatabase {
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "tables")]
    pub schema: Schema,
}
