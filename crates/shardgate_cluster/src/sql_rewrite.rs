//! Textual SQL rewriting used when a query is split per shard.
//!
//! Not a parser: the clause is spliced in front of the
//! first trailing modifier found in the text.

const TRAILING_MODIFIERS: [&str; 4] = [" group by", " order by", " limit", " for update"];

/// Add `clause` as an extra filter of `sql`.
///
/// The clause goes in front of the earliest ` group by`, ` order by`,
/// ` limit` or ` for update` (matched at index > 0), else at the end. It is
/// joined with ` and ` if the text already contains `where`, otherwise it is
/// introduced with ` where `. Matching is case-sensitive.
pub fn insert_sql_clause(sql: &str, clause: &str) -> String {
    let insert_at = TRAILING_MODIFIERS
        .iter()
        .filter_map(|m| sql.find(m))
        .filter(|&idx| idx > 0)
        .min()
        .unwrap_or(sql.len());

    let joiner = if sql.contains("where") { " and " } else { " where " };

    let mut out = String::with_capacity(sql.len() + joiner.len() + clause.len());
    out.push_str(&sql[..insert_at]);
    out.push_str(joiner);
    out.push_str(clause);
    out.push_str(&sql[insert_at..]);
    out
}

/// True for statements that modify rows: insert, update, delete.
pub fn is_dml(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");
    ["insert", "update", "delete"]
        .iter()
        .any(|kw| first.eq_ignore_ascii_case(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLAUSE: &str = "keyspace_id in (:keyspace_id0, :keyspace_id1)";

    #[test]
    fn test_insert_sql_clause() {
        let cases = [
            (
                "select a from table",
                "select a from table where keyspace_id in (:keyspace_id0, :keyspace_id1)",
            ),
            (
                "select a from table where id = 1",
                "select a from table where id = 1 and keyspace_id in (:keyspace_id0, :keyspace_id1)",
            ),
            (
                "select a from table group by a",
                "select a from table where keyspace_id in (:keyspace_id0, :keyspace_id1) group by a",
            ),
            (
                "select a from table where id = 1 order by a limit 10",
                "select a from table where id = 1 and keyspace_id in (:keyspace_id0, :keyspace_id1) order by a limit 10",
            ),
            (
                "select a from table where id = 1 for update",
                "select a from table where id = 1 and keyspace_id in (:keyspace_id0, :keyspace_id1) for update",
            ),
        ];
        for (sql, want) in cases {
            assert_eq!(insert_sql_clause(sql, CLAUSE), want, "input: {sql}");
        }
    }

    #[test]
    fn test_earliest_modifier_wins() {
        let got = insert_sql_clause("select a from t limit 5 for update", "x = 1");
        assert_eq!(got, "select a from t where x = 1 limit 5 for update");
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let got = insert_sql_clause("SELECT a FROM t WHERE b = 1", "x = 1");
        assert_eq!(got, "SELECT a FROM t WHERE b = 1 where x = 1");
    }

    #[test]
    fn test_is_dml() {
        assert!(is_dml("update table set a = b"));
        assert!(is_dml("  INSERT into t values (1)"));
        assert!(is_dml("delete from t"));
        assert!(!is_dml("select * from updates"));
        assert!(!is_dml(""));
    }
}
