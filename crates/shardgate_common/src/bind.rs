use std::collections::BTreeMap;
use std::fmt;

/// A bind-variable value passed alongside SQL text. The gateway never
/// inspects these beyond copying them into per-shard requests.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Int64(i64),
    Uint64(u64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<BindValue>),
}

impl BindValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BindValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BindValue::Int64(v) => Some(*v),
            BindValue::Uint64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BindValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for BindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindValue::Null => write!(f, "NULL"),
            BindValue::Int64(v) => write!(f, "{v}"),
            BindValue::Uint64(v) => write!(f, "{v}"),
            BindValue::Float64(v) => write!(f, "{v}"),
            BindValue::Text(s) => write!(f, "'{s}'"),
            BindValue::Bytes(b) => write!(f, "x'{}'", hex::encode(b)),
            BindValue::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i64> for BindValue {
    fn from(v: i64) -> Self {
        BindValue::Int64(v)
    }
}

impl From<u64> for BindValue {
    fn from(v: u64) -> Self {
        BindValue::Uint64(v)
    }
}

impl From<&str> for BindValue {
    fn from(v: &str) -> Self {
        BindValue::Text(v.to_string())
    }
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        BindValue::Text(v)
    }
}

/// Named bind variables. Ordered so per-shard requests are deterministic.
pub type BindVars = BTreeMap<String, BindValue>;

/// SQL text plus its bind variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub bind_vars: BindVars,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bind_vars: BindVars::new(),
        }
    }

    pub fn with_bind_vars(sql: impl Into<String>, bind_vars: BindVars) -> Self {
        Self {
            sql: sql.into(),
            bind_vars,
        }
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<BindValue>) -> Self {
        self.bind_vars.insert(name.into(), value.into());
        self
    }
}

/// Column metadata of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub type_name: String,
}

impl Field {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

pub type Row = Vec<BindValue>;

/// Result of one query on one shard, or the merged result of a scatter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.rows.is_empty() && self.rows_affected == 0
    }

    /// Fold `other` into `self`: fields from the first result that has any,
    /// rows appended, affected counts summed, a non-zero insert id wins.
    pub fn append(&mut self, other: QueryResult) {
        if self.fields.is_empty() {
            self.fields = other.fields;
        }
        self.rows_affected += other.rows_affected;
        if other.insert_id != 0 {
            self.insert_id = other.insert_id;
        }
        self.rows.extend(other.rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_row(id: i64) -> QueryResult {
        QueryResult {
            fields: vec![Field::new("id", "INT64")],
            rows: vec![vec![BindValue::Int64(id)]],
            rows_affected: 1,
            insert_id: 0,
        }
    }

    #[test]
    fn test_append_keeps_first_fields_and_sums() {
        let mut acc = QueryResult::empty();
        acc.append(QueryResult::empty());
        acc.append(one_row(1));
        let mut second = one_row(2);
        second.fields = vec![Field::new("other", "TEXT")];
        second.insert_id = 42;
        acc.append(second);
        acc.append(one_row(3));

        assert_eq!(acc.fields, vec![Field::new("id", "INT64")]);
        assert_eq!(acc.rows.len(), 3);
        assert_eq!(acc.rows[1], vec![BindValue::Int64(2)]);
        assert_eq!(acc.rows_affected, 3);
        assert_eq!(acc.insert_id, 42);
    }

    #[test]
    fn test_bind_value_display() {
        let list = BindValue::List(vec![BindValue::Int64(1), "a".into(), BindValue::Null]);
        assert_eq!(list.to_string(), "(1, 'a', NULL)");
        assert_eq!(BindValue::Bytes(vec![0x20]).to_string(), "x'20'");
        assert_eq!(BindValue::Uint64(7).as_i64(), Some(7));
    }
}
