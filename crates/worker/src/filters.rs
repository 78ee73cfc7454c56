//! Translation of request filter trees into SQL predicates.
//!
//! Filters arrive as the JSON tree the web query-builder widgets emit: a
//! `condition` (`AND`/`OR`) over `rules`, each rule either a nested tree or
//! a leaf `{id, operator, value}`. A malformed tree is user input, not a
//! bug, and is reported as such.

use errors::ErrorMetadata;
use itertools::Itertools;

use crate::sql::{
    quote_ident,
    sql_literal,
};

fn bad_filter(msg: String) -> anyhow::Error {
    ErrorMetadata::bad_user_input("InvalidFilter", msg).into()
}

pub fn build_filter_clause(filters: &serde_json::Value) -> anyhow::Result<String> {
    let obj = filters
        .as_object()
        .ok_or_else(|| bad_filter("Filter tree must be an object".to_owned()))?;
    let condition = obj
        .get("condition")
        .and_then(|c| c.as_str())
        .ok_or_else(|| bad_filter("Filter tree is missing its condition".to_owned()))?;
    let joiner = match condition {
        "AND" => " AND ",
        "OR" => " OR ",
        other => return Err(bad_filter(format!("Unknown filter condition: {other}"))),
    };
    let rules = obj
        .get("rules")
        .and_then(|r| r.as_array())
        .ok_or_else(|| bad_filter("Filter tree is missing its rules".to_owned()))?;
    if rules.is_empty() {
        return Err(bad_filter("Filter tree has no rules".to_owned()));
    }
    let clauses: Vec<String> = rules
        .iter()
        .map(|rule| {
            if rule.get("condition").is_some() {
                Ok(format!("({})", build_filter_clause(rule)?))
            } else {
                build_rule_clause(rule)
            }
        })
        .collect::<anyhow::Result<_>>()?;
    Ok(clauses.into_iter().join(joiner))
}

fn build_rule_clause(rule: &serde_json::Value) -> anyhow::Result<String> {
    let column = rule
        .get("id")
        .and_then(|c| c.as_str())
        .ok_or_else(|| bad_filter("Filter rule is missing its column id".to_owned()))?;
    let operator = rule
        .get("operator")
        .and_then(|o| o.as_str())
        .ok_or_else(|| bad_filter(format!("Filter rule on {column} is missing its operator")))?;
    let column = quote_ident(column);
    let value = rule.get("value").unwrap_or(&serde_json::Value::Null);
    let wants_value = !matches!(operator, "is_null" | "is_not_null");
    if wants_value && value.is_null() {
        return Err(bad_filter(format!(
            "Filter rule on {column} with operator {operator} is missing its value"
        )));
    }
    let clause = match operator {
        "equal" => format!("{column} = {}", sql_literal(value)),
        "not_equal" => format!("{column} <> {}", sql_literal(value)),
        "greater" => format!("{column} > {}", sql_literal(value)),
        "less" => format!("{column} < {}", sql_literal(value)),
        "greater_or_equal" => format!("{column} >= {}", sql_literal(value)),
        "less_or_equal" => format!("{column} <= {}", sql_literal(value)),
        "between" | "not_between" => {
            let bounds = value.as_array().filter(|b| b.len() == 2).ok_or_else(|| {
                bad_filter(format!("Filter rule on {column} needs a [low, high] value"))
            })?;
            let not = if operator == "not_between" { "NOT " } else { "" };
            format!(
                "{column} {not}BETWEEN {} AND {}",
                sql_literal(&bounds[0]),
                sql_literal(&bounds[1]),
            )
        },
        "in" => {
            let items = value.as_array().filter(|items| !items.is_empty()).ok_or_else(|| {
                bad_filter(format!("Filter rule on {column} needs a non-empty list value"))
            })?;
            format!("{column} IN ({})", items.iter().map(sql_literal).join(","))
        },
        "is_null" => format!("{column} IS NULL"),
        "is_not_null" => format!("{column} IS NOT NULL"),
        other => return Err(bad_filter(format!("Unknown filter operator: {other}"))),
    };
    Ok(clause)
}
