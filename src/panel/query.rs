//! Typed SELECT builder for store queries
//!
//! Identifiers are validated once when an [`Ident`] is created; values never
//! reach the SQL text and are bound as `?` parameters instead.
//!
//! ```
//! use sealpanel::panel::query::{Ident, Order, Predicate, SelectQuery};
//!
//! let query = SelectQuery::from(Ident::from_static("clicks"))
//!     .column(Ident::from_static("produkt_id"))
//!     .count_as(Ident::from_static("total_clicks"))
//!     .filter(Predicate::Eq(Ident::from_static("haendler_bez"), "shop-a".to_string().into()))
//!     .group_by(Ident::from_static("produkt_id"))
//!     .order_by(Ident::from_static("total_clicks"), Order::Desc)
//!     .limit(200)
//!     .build();
//! assert!(query.sql.starts_with("SELECT produkt_id, COUNT(*) AS total_clicks FROM clicks"));
//! ```

use rusqlite::types::Value;
use std::fmt;
use std::sync::Arc;

use super::error::PanelError;

/// A validated SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self, PanelError> {
        let name = name.into();
        if is_valid_identifier(&name) {
            Ok(Self(name))
        } else {
            Err(PanelError::InvalidIdentifier(name))
        }
    }

    /// Identifier known at compile time
    ///
    /// Invalid names are a programming error and are caught in debug builds.
    pub fn from_static(name: &'static str) -> Self {
        debug_assert!(is_valid_identifier(name), "invalid identifier: {}", name);
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
enum Expr {
    Column(Ident),
    CountAll,
    Min(Ident),
    Max(Ident),
}

#[derive(Debug, Clone)]
struct SelectItem {
    expr: Expr,
    alias: Option<Ident>,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Ident, Value),
    /// Closed range `low <= column <= high`
    Between(Ident, i64, i64),
    /// Spell `[start, end)` overlaps `[from, to)`
    Overlaps {
        start: Ident,
        end: Ident,
        from: i64,
        to: i64,
    },
    /// Spell `[start, end)` covers the instant `at`
    ActiveAt { start: Ident, end: Ident, at: i64 },
    /// Membership in a literal list; an empty list matches nothing
    In(Ident, Vec<Value>),
    /// Rows whose column is NULL are kept
    NotInSubquery(Ident, Box<SelectQuery>),
}

impl Predicate {
    pub(crate) fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Predicate::Eq(column, value) => {
                sql.push_str(&format!("{} = ?", column));
                params.push(value.clone());
            }
            Predicate::Between(column, low, high) => {
                sql.push_str(&format!("{} >= ? AND {} <= ?", column, column));
                params.push(Value::Integer(*low));
                params.push(Value::Integer(*high));
            }
            Predicate::Overlaps { start, end, from, to } => {
                sql.push_str(&format!("{} < ? AND {} > ?", start, end));
                params.push(Value::Integer(*to));
                params.push(Value::Integer(*from));
            }
            Predicate::ActiveAt { start, end, at } => {
                sql.push_str(&format!("{} <= ? AND {} > ?", start, end));
                params.push(Value::Integer(*at));
                params.push(Value::Integer(*at));
            }
            Predicate::In(column, values) => {
                if values.is_empty() {
                    sql.push_str("0 = 1");
                } else {
                    let placeholders = vec!["?"; values.len()].join(", ");
                    sql.push_str(&format!("{} IN ({})", column, placeholders));
                    params.extend(values.iter().cloned());
                }
            }
            Predicate::NotInSubquery(column, subquery) => {
                sql.push_str(&format!("({} IS NULL OR {} NOT IN (", column, column));
                subquery.render(sql, params);
                sql.push_str("))");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// SQL text plus its positional parameters
#[derive(Debug, Clone)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct SelectQuery {
    table: Ident,
    distinct: bool,
    items: Vec<SelectItem>,
    predicates: Vec<Predicate>,
    group_by: Vec<Ident>,
    order_by: Vec<(Ident, Order)>,
    limit: Option<u64>,
}

impl SelectQuery {
    pub fn from(table: Ident) -> Self {
        Self {
            table,
            distinct: false,
            items: Vec::new(),
            predicates: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn table(&self) -> &Ident {
        &self.table
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn column(mut self, column: Ident) -> Self {
        self.items.push(SelectItem { expr: Expr::Column(column), alias: None });
        self
    }

    pub fn count_as(mut self, alias: Ident) -> Self {
        self.items.push(SelectItem { expr: Expr::CountAll, alias: Some(alias) });
        self
    }

    pub fn min_as(mut self, column: Ident, alias: Ident) -> Self {
        self.items.push(SelectItem { expr: Expr::Min(column), alias: Some(alias) });
        self
    }

    pub fn max_as(mut self, column: Ident, alias: Ident) -> Self {
        self.items.push(SelectItem { expr: Expr::Max(column), alias: Some(alias) });
        self
    }

    /// Add a predicate; predicates are AND-ed
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn group_by(mut self, column: Ident) -> Self {
        self.group_by.push(column);
        self
    }

    pub fn order_by(mut self, column: Ident, order: Order) -> Self {
        self.order_by.push((column, order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(&self) -> BuiltQuery {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.render(&mut sql, &mut params);
        BuiltQuery { sql, params }
    }

    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        sql.push_str("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        if self.items.is_empty() {
            sql.push('*');
        } else {
            let items: Vec<String> = self
                .items
                .iter()
                .map(|item| {
                    let expr = match &item.expr {
                        Expr::Column(column) => column.to_string(),
                        Expr::CountAll => "COUNT(*)".to_string(),
                        Expr::Min(column) => format!("MIN({})", column),
                        Expr::Max(column) => format!("MAX({})", column),
                    };
                    match &item.alias {
                        Some(alias) => format!("{} AS {}", expr, alias),
                        None => expr,
                    }
                })
                .collect();
            sql.push_str(&items.join(", "));
        }

        sql.push_str(&format!(" FROM {}", self.table));

        for (i, predicate) in self.predicates.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            predicate.render(sql, params);
        }

        if !self.group_by.is_empty() {
            let columns: Vec<&str> = self.group_by.iter().map(Ident::as_str).collect();
            sql.push_str(&format!(" GROUP BY {}", columns.join(", ")));
        }

        if !self.order_by.is_empty() {
            let keys: Vec<String> = self
                .order_by
                .iter()
                .map(|(column, order)| match order {
                    Order::Asc => format!("{} ASC", column),
                    Order::Desc => format!("{} DESC", column),
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }

        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
    }
}

/// Interceptor that rewrites a query before it is executed
pub trait QueryCriterion: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this criterion can be applied to queries over `table`
    fn applies_to(&self, table: &Ident) -> bool;

    fn apply(&self, query: SelectQuery) -> SelectQuery;
}

/// Drops clicks issued from known scraper IPs (`scraper_ips` relation)
#[derive(Debug, Clone, Default)]
pub struct ExcludeScraperIps;

impl QueryCriterion for ExcludeScraperIps {
    fn name(&self) -> &'static str {
        "exclude_scraper_ips"
    }

    fn applies_to(&self, table: &Ident) -> bool {
        table.as_str() == "clicks"
    }

    fn apply(&self, query: SelectQuery) -> SelectQuery {
        let scrapers = SelectQuery::from(Ident::from_static("scraper_ips")).column(Ident::from_static("ip"));
        query.filter(Predicate::NotInSubquery(Ident::from_static("ip"), Box::new(scrapers)))
    }
}

/// Apply every criterion that targets the query's table, in order
pub fn apply_criteria(query: SelectQuery, criteria: &[Arc<dyn QueryCriterion>]) -> SelectQuery {
    criteria.iter().fold(query, |query, criterion| {
        if criterion.applies_to(query.table()) {
            log::debug!("Applying query criterion: {}", criterion.name());
            criterion.apply(query)
        } else {
            query
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &'static str) -> Ident {
        Ident::from_static(name)
    }

    #[test]
    fn test_identifier_validation() {
        assert!(Ident::new("produkt_id").is_ok());
        assert!(Ident::new("_tmp1").is_ok());
        assert!(Ident::new("1col").is_err());
        assert!(Ident::new("name; DROP TABLE offers").is_err());
        assert!(Ident::new("").is_err());
        assert!(matches!(
            Ident::new("a-b"),
            Err(PanelError::InvalidIdentifier(name)) if name == "a-b"
        ));
    }

    #[test]
    fn test_select_all() {
        let query = SelectQuery::from(id("offers")).build();
        assert_eq!(query.sql, "SELECT * FROM offers");
        assert!(query.params.is_empty());
    }

    #[test]
    fn test_grouped_top_n_query() {
        let query = SelectQuery::from(id("clicks"))
            .column(id("produkt_id"))
            .count_as(id("total_clicks"))
            .filter(Predicate::Eq(id("haendler_bez"), Value::Text("shop".to_string())))
            .filter(Predicate::Between(id("timestamp"), 10, 20))
            .group_by(id("produkt_id"))
            .order_by(id("total_clicks"), Order::Desc)
            .order_by(id("produkt_id"), Order::Asc)
            .limit(5)
            .build();

        assert_eq!(
            query.sql,
            "SELECT produkt_id, COUNT(*) AS total_clicks FROM clicks \
             WHERE haendler_bez = ? AND timestamp >= ? AND timestamp <= ? \
             GROUP BY produkt_id ORDER BY total_clicks DESC, produkt_id ASC LIMIT ?"
        );
        assert_eq!(
            query.params,
            vec![
                Value::Text("shop".to_string()),
                Value::Integer(10),
                Value::Integer(20),
                Value::Integer(5)
            ]
        );
    }

    #[test]
    fn test_interval_predicates_bind_in_order() {
        let query = SelectQuery::from(id("offers"))
            .distinct()
            .column(id("haendler_bez"))
            .filter(Predicate::ActiveAt { start: id("dtimebegin"), end: id("dtimeend"), at: 100 })
            .filter(Predicate::Overlaps { start: id("dtimebegin"), end: id("dtimeend"), from: 1, to: 9 })
            .build();

        assert_eq!(
            query.sql,
            "SELECT DISTINCT haendler_bez FROM offers \
             WHERE dtimebegin <= ? AND dtimeend > ? AND dtimebegin < ? AND dtimeend > ?"
        );
        assert_eq!(
            query.params,
            vec![Value::Integer(100), Value::Integer(100), Value::Integer(9), Value::Integer(1)]
        );
    }

    #[test]
    fn test_in_list_and_extrema() {
        let query = SelectQuery::from(id("offers"))
            .min_as(id("dtimebegin"), id("first_begin"))
            .max_as(id("dtimeend"), id("last_end"))
            .filter(Predicate::In(id("produkt_id"), vec![Value::Integer(1), Value::Integer(2)]))
            .build();
        assert_eq!(
            query.sql,
            "SELECT MIN(dtimebegin) AS first_begin, MAX(dtimeend) AS last_end FROM offers WHERE produkt_id IN (?, ?)"
        );
        assert_eq!(query.params, vec![Value::Integer(1), Value::Integer(2)]);

        let empty = SelectQuery::from(id("offers")).filter(Predicate::In(id("produkt_id"), vec![])).build();
        assert_eq!(empty.sql, "SELECT * FROM offers WHERE 0 = 1");
    }

    #[test]
    fn test_scraper_criterion_only_touches_clicks() {
        let criteria: Vec<Arc<dyn QueryCriterion>> = vec![Arc::new(ExcludeScraperIps)];

        let clicks = apply_criteria(SelectQuery::from(id("clicks")), &criteria).build();
        assert_eq!(
            clicks.sql,
            "SELECT * FROM clicks WHERE (ip IS NULL OR ip NOT IN (SELECT ip FROM scraper_ips))"
        );

        let offers = apply_criteria(SelectQuery::from(id("offers")), &criteria).build();
        assert_eq!(offers.sql, "SELECT * FROM offers");
    }
}
