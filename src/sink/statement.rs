// ABOUTME: Pure SQL builders for sink writes (UPDATE, INSERT, DELETE)
// ABOUTME: Identifiers are always quoted and values always bound as $n parameters

use crate::utils::quote_ident;

/// Decides which entity fields a sink writes.
///
/// Primary-key columns always pass. Other columns pass when the whitelist is
/// empty or contains them, and the blacklist does not.
#[derive(Debug, Clone, Copy)]
pub struct ColumnFilter<'a> {
    primary_key: &'a [String],
    whitelist: &'a [String],
    blacklist: &'a [String],
}

impl<'a> ColumnFilter<'a> {
    pub fn new(primary_key: &'a [String], whitelist: &'a [String], blacklist: &'a [String]) -> Self {
        Self {
            primary_key,
            whitelist,
            blacklist,
        }
    }

    pub fn keeps(&self, column: &str) -> bool {
        if self.primary_key.iter().any(|k| k == column) {
            return true;
        }
        let listed = self.whitelist.is_empty() || self.whitelist.iter().any(|c| c == column);
        listed && !self.blacklist.iter().any(|c| c == column)
    }
}

fn where_clause(primary_key: &[String], first_param: usize) -> String {
    primary_key
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{} = ${}", quote_ident(column), first_param + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `UPDATE table SET c1 = $1, ... [, ts = $n] WHERE pk1 = $m AND ...`
///
/// Parameters: column values in order, then the timestamp, then the key values.
pub fn build_update(
    table: &str,
    columns: &[&str],
    timestamp: Option<&str>,
    primary_key: &[String],
) -> String {
    let mut setters: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{} = ${}", quote_ident(column), i + 1))
        .collect();
    if let Some(ts) = timestamp {
        setters.push(format!("{} = ${}", quote_ident(ts), setters.len() + 1));
    }
    let first_key_param = setters.len() + 1;

    format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        setters.join(", "),
        where_clause(primary_key, first_key_param)
    )
}

/// `INSERT INTO table (c1, ... [, ts]) VALUES ($1, ...)`
pub fn build_insert(table: &str, columns: &[&str], timestamp: Option<&str>) -> String {
    let mut quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    if let Some(ts) = timestamp {
        quoted.push(quote_ident(ts));
    }
    let placeholders: Vec<String> = (1..=quoted.len()).map(|i| format!("${}", i)).collect();

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        quoted.join(", "),
        placeholders.join(", ")
    )
}

/// `DELETE FROM table WHERE pk1 = $1 AND pk2 = $2 ...`
pub fn build_delete(table: &str, primary_key: &[String]) -> String {
    format!("DELETE FROM {} WHERE {}", table, where_clause(primary_key, 1))
}

/// Removes every row; used for the first full run of a truncating sink.
pub fn build_delete_all(table: &str) -> String {
    format!("DELETE FROM {}", table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\"public\".\"widgets\"";

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_whitelist_and_blacklist() {
        let pk = strings(&["id"]);
        let whitelist = strings(&["name"]);
        let blacklist = strings(&["age"]);
        let filter = ColumnFilter::new(&pk, &whitelist, &blacklist);

        let kept: Vec<&str> = ["id", "name", "age", "email"]
            .into_iter()
            .filter(|c| filter.keeps(c))
            .collect();
        assert_eq!(kept, vec!["id", "name"]);
    }

    #[test]
    fn test_filter_never_drops_primary_key() {
        let pk = strings(&["id"]);
        let whitelist = strings(&["name"]);
        let blacklist = strings(&["id", "name"]);
        let filter = ColumnFilter::new(&pk, &whitelist, &blacklist);

        assert!(filter.keeps("id"));
        assert!(!filter.keeps("name"));
    }

    #[test]
    fn test_filter_empty_lists_keep_everything() {
        let pk = strings(&["id"]);
        let filter = ColumnFilter::new(&pk, &[], &[]);
        assert!(filter.keeps("anything"));
    }

    #[test]
    fn test_build_update_with_timestamp() {
        let sql = build_update(
            TABLE,
            &["id", "color"],
            Some("bridge_timestamp"),
            &strings(&["id"]),
        );
        assert_eq!(
            sql,
            "UPDATE \"public\".\"widgets\" SET \"id\" = $1, \"color\" = $2, \"bridge_timestamp\" = $3 WHERE \"id\" = $4"
        );
    }

    #[test]
    fn test_build_update_composite_key() {
        let sql = build_update(
            "\"public\".\"lines\"",
            &["order_id", "line", "qty"],
            None,
            &strings(&["order_id", "line"]),
        );
        assert!(sql.ends_with("WHERE \"order_id\" = $4 AND \"line\" = $5"));
    }

    #[test]
    fn test_build_insert() {
        assert_eq!(
            build_insert(TABLE, &["id", "color"], None),
            "INSERT INTO \"public\".\"widgets\" (\"id\", \"color\") VALUES ($1, $2)"
        );
        assert_eq!(
            build_insert(TABLE, &["id"], Some("bridge_timestamp")),
            "INSERT INTO \"public\".\"widgets\" (\"id\", \"bridge_timestamp\") VALUES ($1, $2)"
        );
    }

    #[test]
    fn test_build_delete() {
        assert_eq!(
            build_delete(TABLE, &strings(&["id", "rev"])),
            "DELETE FROM \"public\".\"widgets\" WHERE \"id\" = $1 AND \"rev\" = $2"
        );
        assert_eq!(build_delete_all(TABLE), "DELETE FROM \"public\".\"widgets\"");
    }

    #[test]
    fn test_identifiers_are_quoted() {
        let sql = build_insert(TABLE, &["we\"ird"], None);
        assert!(sql.contains("\"we\"\"ird\""));
    }
}
