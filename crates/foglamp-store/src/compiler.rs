//! Translation of query documents into parameterised SQL.
//!
//! The compiler walks the typed DSL and emits SQL text with `?`
//! placeholders plus the ordered list of values to bind. Caller-supplied
//! *values* (where scalars, `in` members, `older`/`newer` intervals, the
//! append payload fields) are always bound; column names, operations,
//! aliases and format strings are interpolated and treated as trusted.

use rusqlite::types::Value as SqlValue;

use foglamp_types::{validate_user_ts, AppendPayload, NOW_LITERAL};

use crate::buffer::SqlBuffer;
use crate::dsl::{Aggregate, Condition, Group, Query, ReturnColumn, Scalar, Where};
use crate::error::{Error, Result};
use crate::format::{F_DATEH24_MS, F_DATEH24_SEC};

/// SQL expression inserting the database's current time for `now()` rows.
const NOW_READING: &str = "strftime('%Y-%m-%d %H:%M:%f', 'now')";

/// A compiled statement: SQL text plus the values to bind, in placeholder
/// order.
#[derive(Debug, Clone)]
pub struct CompiledSql {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl From<Scalar> for SqlValue {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Integer(i) => SqlValue::Integer(i),
            Scalar::Double(d) => SqlValue::Real(d),
            Scalar::Text(t) => SqlValue::Text(t),
        }
    }
}

/// The default readings projection with localtime display formatting.
/// `user_ts` keeps its microseconds and trailing timezone text through the
/// `substr(..., instr(..., '.'), 7)` concatenation.
fn default_readings_projection(sql: &mut SqlBuffer, tz: &str) {
    sql.append("id, asset_code, read_key, reading, strftime('");
    sql.append(F_DATEH24_SEC);
    sql.append("', user_ts, '");
    sql.append(tz);
    sql.append("') || substr(user_ts, instr(user_ts, '.'), 7) AS user_ts, strftime('");
    sql.append(F_DATEH24_MS);
    sql.append("', ts, '");
    sql.append(tz);
    sql.append("') AS ts");
}

/// The formatted `user_ts` expression used wherever a readings query names
/// the column bare (projection, aggregation target, grouping).
fn formatted_user_ts(sql: &mut SqlBuffer, tz: &str) {
    sql.append("strftime('");
    sql.append(F_DATEH24_SEC);
    sql.append("', user_ts, '");
    sql.append(tz);
    sql.append("') || substr(user_ts, instr(user_ts, '.'), 7)");
}

/// Compile a SELECT against a generic table.
pub fn compile_retrieve(table: &str, query: &Query) -> Result<CompiledSql> {
    compile_select(table, query, false)
}

/// Compile a SELECT against the readings table, with automatic default
/// formatting of `user_ts` and `ts`.
pub fn compile_retrieve_readings(query: &Query) -> Result<CompiledSql> {
    compile_select("readings", query, true)
}

fn compile_select(table: &str, query: &Query, is_readings: bool) -> Result<CompiledSql> {
    let mut sql = SqlBuffer::new();
    let mut params: Vec<SqlValue> = Vec::new();
    // json_type() null checks collected while compiling projections and
    // aggregates, conjoined onto the caller's where clause.
    let mut json_constraints: Vec<String> = Vec::new();
    let mut is_aggregate = false;

    sql.append("SELECT ");
    if let Some(modifier) = &query.modifier {
        sql.append(modifier);
        sql.append_char(' ');
    }

    if let Some(aggregates) = &query.aggregate {
        is_aggregate = true;
        compile_aggregates(
            aggregates.as_slice(),
            query,
            &mut sql,
            &mut json_constraints,
            is_readings,
        )?;
    } else if let Some(returns) = &query.returns {
        compile_projection(returns, &mut sql, &mut json_constraints, is_readings)?;
    } else if is_readings {
        default_readings_projection(&mut sql, "localtime");
    } else {
        sql.append("*");
    }

    sql.append(" FROM ");
    sql.append(table);

    if let Some(node) = &query.condition {
        sql.append(" WHERE ");
        let tree = Where::from_node(node)?;
        compile_where(&tree, &mut sql, &mut params, false);
        for constraint in &json_constraints {
            sql.append(" AND ");
            sql.append(constraint);
        }
    } else if is_aggregate {
        // Force the planner onto the asset_code index when aggregating
        // without a filter.
        sql.append(" WHERE asset_code = asset_code");
    }

    compile_modifiers(query, &mut sql)?;
    sql.append_char(';');

    Ok(CompiledSql {
        sql: sql.coalesce(),
        params,
    })
}

/// Compile a DELETE against a table, with an optional where tree.
pub fn compile_delete(table: &str, query: &Query) -> Result<CompiledSql> {
    let mut sql = SqlBuffer::new();
    let mut params: Vec<SqlValue> = Vec::new();

    sql.append("DELETE FROM ");
    sql.append(table);
    if let Some(node) = &query.condition {
        sql.append(" WHERE ");
        let tree = Where::from_node(node)?;
        compile_where(&tree, &mut sql, &mut params, false);
    }
    sql.append_char(';');

    Ok(CompiledSql {
        sql: sql.coalesce(),
        params,
    })
}

/// Compile an append payload into one multi-row INSERT.
///
/// Elements with an invalid `user_ts` are skipped with a logged error and
/// the rest proceed. Returns the statement and the number of rows it
/// inserts; zero rows means nothing to execute.
pub fn compile_append(payload: &AppendPayload) -> Result<(CompiledSql, usize)> {
    let mut sql = SqlBuffer::new();
    let mut params: Vec<SqlValue> = Vec::new();
    let mut rows = 0usize;

    sql.append("INSERT INTO readings ( user_ts, asset_code, read_key, reading ) VALUES ");

    for reading in &payload.readings {
        let user_ts = reading.user_ts.as_str();
        if user_ts != NOW_LITERAL && validate_user_ts(user_ts).is_err() {
            tracing::error!(operation = "appendReadings", "Invalid date |{user_ts}|");
            continue;
        }

        if rows > 0 {
            sql.append(", (");
        } else {
            sql.append_char('(');
        }
        rows += 1;

        if user_ts == NOW_LITERAL {
            sql.append(NOW_READING);
        } else {
            sql.append_char('?');
            params.push(SqlValue::Text(user_ts.to_string()));
        }

        sql.append(", ?, ?, ?)");
        params.push(SqlValue::Text(reading.asset_code.clone()));
        match reading.read_key() {
            Some(key) => params.push(SqlValue::Text(key.to_string())),
            None => params.push(SqlValue::Null),
        }
        params.push(SqlValue::Text(reading.reading.to_string()));
    }
    sql.append_char(';');

    Ok((
        CompiledSql {
            sql: sql.coalesce(),
            params,
        },
        rows,
    ))
}

fn compile_projection(
    returns: &[ReturnColumn],
    sql: &mut SqlBuffer,
    json_constraints: &mut Vec<String>,
    is_readings: bool,
) -> Result<()> {
    for (col, entry) in returns.iter().enumerate() {
        if col > 0 {
            sql.append(", ");
        }
        match entry {
            ReturnColumn::Name(name) => {
                if is_readings && name == "user_ts" {
                    formatted_user_ts(sql, "localtime");
                    sql.append(" AS user_ts");
                } else if is_readings && name == "ts" {
                    sql.append("strftime('");
                    sql.append(F_DATEH24_MS);
                    sql.append("', ts, 'localtime') AS ts");
                } else {
                    sql.append(name);
                }
            }
            ReturnColumn::Column {
                column,
                alias,
                format,
                timezone,
            } => {
                if let Some(format) = format {
                    sql.append("strftime('");
                    sql.append(format);
                    sql.append("', ");
                    sql.append(column);
                    sql.append(", 'localtime')");
                    if alias.is_none() {
                        sql.append(" AS ");
                        sql.append(column);
                    }
                } else if let Some(timezone) = timezone {
                    let tz = parse_timezone(timezone)?;
                    if is_readings && column == "user_ts" {
                        formatted_user_ts(sql, tz);
                    } else {
                        sql.append("strftime('");
                        sql.append(F_DATEH24_MS);
                        sql.append("', ");
                        sql.append(column);
                        sql.append(", '");
                        sql.append(tz);
                        sql.append("')");
                    }
                    if alias.is_none() {
                        sql.append(" AS ");
                        sql.append(column);
                    }
                } else if is_readings && column == "user_ts" {
                    formatted_user_ts(sql, "localtime");
                    if alias.is_none() {
                        sql.append(" AS user_ts");
                    }
                } else if is_readings && column == "ts" {
                    sql.append("strftime('");
                    sql.append(F_DATEH24_MS);
                    sql.append("', ts, 'localtime')");
                    if alias.is_none() {
                        sql.append(" AS ts");
                    }
                } else {
                    sql.append(column);
                }
                if let Some(alias) = alias {
                    sql.append(" AS \"");
                    sql.append(alias);
                    sql.append_char('"');
                }
            }
            ReturnColumn::Json { json, alias } => {
                let path = json.properties.path();
                sql.append("json_extract(");
                sql.append(&json.column);
                sql.append(", '$.");
                sql.append(&path);
                sql.append("')");
                json_constraints.push(format!(
                    "json_type({}, '$.{}') IS NOT NULL",
                    json.column, path
                ));
                if let Some(alias) = alias {
                    sql.append(" AS \"");
                    sql.append(alias);
                    sql.append_char('"');
                }
            }
        }
    }
    Ok(())
}

fn compile_aggregates(
    aggregates: &[Aggregate],
    query: &Query,
    sql: &mut SqlBuffer,
    json_constraints: &mut Vec<String>,
    is_readings: bool,
) -> Result<()> {
    for (index, aggregate) in aggregates.iter().enumerate() {
        if index > 0 {
            sql.append(", ");
        }
        sql.append(&aggregate.operation);
        sql.append_char('(');

        let default_alias_column = match (&aggregate.column, &aggregate.json) {
            (Some(column), _) => {
                if column == "*" {
                    // Faster to count ROWID than *
                    sql.append("ROWID");
                } else if is_readings && column == "user_ts" {
                    // Aggregate over the formatted value so grouping on
                    // the alias lines up.
                    formatted_user_ts(sql, "localtime");
                } else {
                    sql.append_char('"');
                    sql.append(column);
                    sql.append_char('"');
                }
                column.clone()
            }
            (None, Some(json)) => {
                let path = json.properties.path();
                sql.append("json_extract(");
                sql.append(&json.column);
                sql.append(", '$.");
                sql.append(&path);
                sql.append("')");
                json_constraints.push(format!(
                    "json_type({}, '$.{}') IS NOT NULL",
                    json.column, path
                ));
                json.column.clone()
            }
            (None, None) => {
                return Err(Error::shape(
                    "aggregate",
                    "Missing property \"column\" or \"json\"",
                ));
            }
        };

        sql.append(") AS \"");
        match &aggregate.alias {
            Some(alias) => sql.append(alias),
            None => {
                sql.append(&aggregate.operation);
                sql.append_char('_');
                sql.append(&default_alias_column);
            }
        }
        sql.append_char('"');
    }

    // Grouping and bucketing columns ride along in the select list so the
    // result rows carry the group key.
    if let Some(group) = &query.group {
        sql.append(", ");
        match group {
            Group::Name(name) => sql.append(name),
            Group::Column {
                column,
                format,
                alias,
            } => {
                match format {
                    Some(format) => {
                        sql.append("strftime('");
                        sql.append(format);
                        sql.append("', ");
                        sql.append(column);
                        sql.append_char(')');
                    }
                    None => sql.append(column),
                }
                sql.append(" AS \"");
                sql.append(alias.as_deref().unwrap_or(column));
                sql.append_char('"');
            }
        }
    }

    if let Some(tb) = &query.timebucket {
        sql.append(", ");
        let bucket = match &tb.size {
            Some(size) => format!(
                "{size} * round(strftime('%J', {ts}) / {size}, 6)",
                size = size.as_sql(),
                ts = tb.timestamp
            ),
            None => format!("strftime('%J', {})", tb.timestamp),
        };
        match &tb.format {
            Some(format) => {
                sql.append("strftime('");
                sql.append(format);
                sql.append("', ");
                sql.append(&bucket);
                sql.append_char(')');
            }
            None => {
                // Default to JulianDay so the bucket keeps milliseconds.
                sql.append("datetime(");
                sql.append(&bucket);
                sql.append_char(')');
            }
        }
        sql.append(" AS \"");
        sql.append(tb.alias.as_deref().unwrap_or("timestamp"));
        sql.append_char('"');
    }

    Ok(())
}

/// GROUP BY, ORDER BY / timebucket, LIMIT and OFFSET, in that order.
fn compile_modifiers(query: &Query, sql: &mut SqlBuffer) -> Result<()> {
    if query.timebucket.is_some() && query.sort.is_some() {
        return Err(Error::shape(
            "query modifiers",
            "Sort and timebucket modifiers can not be used in the same payload",
        ));
    }

    if let Some(group) = &query.group {
        sql.append(" GROUP BY ");
        match group {
            Group::Name(name) => sql.append(name),
            Group::Column { column, format, .. } => match format {
                Some(format) => {
                    sql.append("strftime('");
                    sql.append(format);
                    sql.append("', ");
                    sql.append(column);
                    sql.append_char(')');
                }
                None => sql.append(column),
            },
        }
    }

    if let Some(sorts) = &query.sort {
        sql.append(" ORDER BY ");
        for (index, sort) in sorts.as_slice().iter().enumerate() {
            if index > 0 {
                sql.append(", ");
            }
            sql.append(&sort.column);
            sql.append_char(' ');
            sql.append(sort.direction.as_deref().unwrap_or("ASC"));
        }
    }

    if let Some(tb) = &query.timebucket {
        if query.group.is_some() {
            sql.append(", ");
        } else {
            sql.append(" GROUP BY ");
        }
        sql.append("datetime(strftime('%J', ");
        sql.append(&tb.timestamp);
        sql.append("))");
        sql.append(" ORDER BY datetime(strftime('%J', ");
        sql.append(&tb.timestamp);
        sql.append(")) DESC");
    }

    if let Some(limit) = query.limit {
        sql.append(" LIMIT ");
        sql.append_i64(limit);
    }

    // OFFSET must go after LIMIT
    if let Some(skip) = query.skip {
        if query.limit.is_none() {
            sql.append(" LIMIT -1");
        }
        sql.append(" OFFSET ");
        sql.append_i64(skip);
    }

    Ok(())
}

/// Emit a where tree. Composite nodes are parenthesised to match the tree
/// structure; leaves bind their values as placeholders.
fn compile_where(
    tree: &Where,
    sql: &mut SqlBuffer,
    params: &mut Vec<SqlValue>,
    convert_localtime: bool,
) {
    match tree {
        Where::Leaf { column, op } => {
            sql.append(column);
            match op {
                Condition::Compare { operator, value } => {
                    sql.append_char(' ');
                    sql.append(operator);
                    sql.append(" ?");
                    params.push(value.clone().into());
                }
                Condition::Older(seconds) | Condition::Newer(seconds) => {
                    sql.append(if matches!(op, Condition::Older(_)) {
                        " < datetime('now', ?"
                    } else {
                        " > datetime('now', ?"
                    });
                    if convert_localtime {
                        sql.append(", 'localtime')");
                    } else {
                        sql.append_char(')');
                    }
                    params.push(SqlValue::Text(format!("-{seconds} seconds")));
                }
                Condition::In { negated, values } => {
                    sql.append(if *negated { " not in ( " } else { " in ( " });
                    for (index, value) in values.iter().enumerate() {
                        if index > 0 {
                            sql.append(", ");
                        }
                        sql.append_char('?');
                        params.push(value.clone().into());
                    }
                    sql.append(" )");
                }
            }
        }
        Where::And(left, right) => {
            sql.append_char('(');
            compile_where(left, sql, params, convert_localtime);
            sql.append(" AND ");
            compile_where(right, sql, params, convert_localtime);
            sql.append_char(')');
        }
        Where::Or(left, right) => {
            sql.append_char('(');
            compile_where(left, sql, params, convert_localtime);
            sql.append(" OR ");
            compile_where(right, sql, params, convert_localtime);
            sql.append_char(')');
        }
    }
}

fn parse_timezone(tz: &str) -> Result<&'static str> {
    let lower = tz.to_ascii_lowercase();
    if lower.starts_with("utc") {
        Ok("utc")
    } else if lower.starts_with("localtime") {
        Ok("localtime")
    } else {
        Err(Error::shape(
            "retrieve",
            "SQLite3 plugin does not support timezones in queries",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::WhereNode;

    fn retrieve_readings(dsl: &str) -> CompiledSql {
        compile_retrieve_readings(&Query::parse(dsl).unwrap()).unwrap()
    }

    #[test]
    fn test_empty_document_selects_default_projection() {
        let compiled = retrieve_readings("{}");
        assert!(compiled.sql.starts_with("SELECT id, asset_code, read_key, reading"));
        assert!(compiled.sql.contains("AS user_ts"));
        assert!(compiled.sql.contains("strftime('%Y-%m-%d %H:%M:%f', ts, 'localtime') AS ts"));
        assert!(compiled.sql.contains("FROM readings"));
        assert!(!compiled.sql.contains("WHERE"));
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn test_user_ts_keeps_microseconds() {
        let compiled = retrieve_readings(r#"{"return":["user_ts"]}"#);
        assert!(compiled
            .sql
            .contains("substr(user_ts, instr(user_ts, '.'), 7)"));
    }

    #[test]
    fn test_plain_column_projection() {
        let compiled = retrieve_readings(r#"{"return":["asset_code","reading"]}"#);
        assert!(compiled.sql.starts_with("SELECT asset_code, reading FROM readings"));
    }

    #[test]
    fn test_modifier_follows_select() {
        let compiled = retrieve_readings(r#"{"return":["asset_code"],"modifier":"DISTINCT"}"#);
        assert!(compiled.sql.starts_with("SELECT DISTINCT asset_code"));
    }

    #[test]
    fn test_where_binds_values() {
        let compiled = retrieve_readings(
            r#"{"where":{"column":"asset_code","condition":"=","value":"pump'1"}}"#,
        );
        assert!(compiled.sql.contains("WHERE asset_code = ?"));
        assert_eq!(compiled.params.len(), 1);
        match &compiled.params[0] {
            SqlValue::Text(t) => assert_eq!(t, "pump'1"),
            other => panic!("expected text param, got {other:?}"),
        }
    }

    #[test]
    fn test_where_newer_emits_interval_param() {
        let compiled = retrieve_readings(
            r#"{"where":{"column":"user_ts","condition":"newer","value":30}}"#,
        );
        assert!(compiled.sql.contains("user_ts > datetime('now', ?)"));
        assert_eq!(
            compiled.params,
            vec![SqlValue::Text("-30 seconds".into())]
        );
    }

    #[test]
    fn test_where_older_localtime_variant() {
        let node: WhereNode = serde_json::from_str(
            r#"{"column":"user_ts","condition":"older","value":60}"#,
        )
        .unwrap();
        let tree = Where::from_node(&node).unwrap();
        let mut sql = SqlBuffer::new();
        let mut params = Vec::new();
        compile_where(&tree, &mut sql, &mut params, true);
        assert_eq!(
            sql.coalesce(),
            "user_ts < datetime('now', ?, 'localtime')"
        );
        assert_eq!(params, vec![SqlValue::Text("-60 seconds".into())]);
    }

    #[test]
    fn test_where_in_list() {
        let compiled = retrieve_readings(
            r#"{"where":{"column":"asset_code","condition":"in","value":["a","b",3]}}"#,
        );
        assert!(compiled.sql.contains("asset_code in ( ?, ?, ? )"));
        assert_eq!(compiled.params.len(), 3);
        assert!(matches!(compiled.params[2], SqlValue::Integer(3)));
    }

    #[test]
    fn test_where_tree_parenthesised() {
        let compiled = retrieve_readings(
            r#"{"where":{"column":"a","condition":"=","value":1,
                "and":{"column":"b","condition":"=","value":2},
                "or":{"column":"c","condition":"=","value":3}}}"#,
        );
        assert!(compiled.sql.contains("WHERE ((a = ? AND b = ?) OR c = ?)"));
        assert_eq!(compiled.params.len(), 3);
    }

    #[test]
    fn test_aggregate_count_star_uses_rowid() {
        let compiled = retrieve_readings(r#"{"aggregate":{"operation":"count","column":"*"}}"#);
        assert!(compiled.sql.contains("count(ROWID) AS \"count_*\""));
        // Index hint injected when aggregating without a where clause
        assert!(compiled.sql.contains("WHERE asset_code = asset_code"));
    }

    #[test]
    fn test_aggregate_with_where_skips_index_hint() {
        let compiled = retrieve_readings(
            r#"{"aggregate":{"operation":"min","column":"id"},
                "where":{"column":"id","condition":">","value":0}}"#,
        );
        assert!(!compiled.sql.contains("asset_code = asset_code"));
        assert!(compiled.sql.contains("min(\"id\") AS \"min_id\""));
    }

    #[test]
    fn test_aggregate_user_ts_uses_formatted_expression() {
        let compiled = retrieve_readings(r#"{"aggregate":{"operation":"min","column":"user_ts"}}"#);
        assert!(compiled
            .sql
            .contains("min(strftime('%Y-%m-%d %H:%M:%S', user_ts, 'localtime')"));
    }

    #[test]
    fn test_json_return_adds_type_constraint() {
        let compiled = retrieve_readings(
            r#"{"return":[{"json":{"column":"reading","properties":["a","b"]}}],
                "where":{"column":"asset_code","condition":"=","value":"x"}}"#,
        );
        assert!(compiled.sql.contains("json_extract(reading, '$.a.b')"));
        assert!(compiled
            .sql
            .contains("AND json_type(reading, '$.a.b') IS NOT NULL"));
    }

    #[test]
    fn test_timezone_utc() {
        let compiled = retrieve_readings(
            r#"{"return":[{"column":"ts","timezone":"utc"}]}"#,
        );
        assert!(compiled.sql.contains("strftime('%Y-%m-%d %H:%M:%f', ts, 'utc') AS ts"));
    }

    #[test]
    fn test_timezone_rejects_other_zones() {
        let query = Query::parse(r#"{"return":[{"column":"ts","timezone":"CET"}]}"#).unwrap();
        assert!(compile_retrieve_readings(&query).is_err());
    }

    #[test]
    fn test_group_by_and_sort() {
        let compiled = retrieve_readings(
            r#"{"aggregate":{"operation":"count","column":"*"},
                "group":"asset_code",
                "sort":{"column":"asset_code","direction":"desc"}}"#,
        );
        assert!(compiled.sql.contains(", asset_code FROM readings"));
        assert!(compiled.sql.contains("GROUP BY asset_code"));
        assert!(compiled.sql.contains("ORDER BY asset_code desc"));
    }

    #[test]
    fn test_sort_defaults_ascending() {
        let compiled = retrieve_readings(r#"{"sort":{"column":"id"}}"#);
        assert!(compiled.sql.contains("ORDER BY id ASC"));
    }

    #[test]
    fn test_limit_and_skip() {
        let compiled = retrieve_readings(r#"{"limit":3,"skip":4}"#);
        assert!(compiled.sql.contains("LIMIT 3 OFFSET 4"));
    }

    #[test]
    fn test_skip_without_limit_emits_sentinel() {
        let compiled = retrieve_readings(r#"{"skip":4}"#);
        assert!(compiled.sql.contains("LIMIT -1 OFFSET 4"));
    }

    #[test]
    fn test_timebucket_groups_and_orders() {
        let compiled = retrieve_readings(
            r#"{"aggregate":{"operation":"avg","column":"id"},
                "timebucket":{"timestamp":"user_ts","size":"5","alias":"bucket"}}"#,
        );
        assert!(compiled
            .sql
            .contains("datetime(5 * round(strftime('%J', user_ts) / 5, 6)) AS \"bucket\""));
        assert!(compiled
            .sql
            .contains("GROUP BY datetime(strftime('%J', user_ts))"));
        assert!(compiled
            .sql
            .contains("ORDER BY datetime(strftime('%J', user_ts)) DESC"));
    }

    #[test]
    fn test_timebucket_and_sort_conflict() {
        let query = Query::parse(
            r#"{"sort":{"column":"id"},
                "timebucket":{"timestamp":"user_ts"}}"#,
        )
        .unwrap();
        assert!(compile_retrieve_readings(&query).is_err());
    }

    #[test]
    fn test_generic_table_default_projection() {
        let compiled = compile_retrieve("streams", &Query::parse("{}").unwrap()).unwrap();
        assert_eq!(compiled.sql, "SELECT * FROM streams;");
    }

    #[test]
    fn test_delete_with_where() {
        let compiled = compile_delete(
            "streams",
            &Query::parse(r#"{"where":{"column":"id","condition":"<=","value":5}}"#).unwrap(),
        )
        .unwrap();
        assert_eq!(compiled.sql, "DELETE FROM streams WHERE id <= ?;");
        assert_eq!(compiled.params, vec![SqlValue::Integer(5)]);
    }

    #[test]
    fn test_append_binds_rows() {
        let payload: AppendPayload = serde_json::from_str(
            r#"{"readings":[
                {"asset_code":"a","user_ts":"2024-01-02 03:04:05.678901+00:00",
                 "reading":{"v":1}},
                {"asset_code":"b","user_ts":"now()","read_key":"None","reading":{"v":2}}]}"#,
        )
        .unwrap();
        let (compiled, rows) = compile_append(&payload).unwrap();
        assert_eq!(rows, 2);
        assert!(compiled.sql.starts_with(
            "INSERT INTO readings ( user_ts, asset_code, read_key, reading ) VALUES (?, ?, ?, ?)"
        ));
        assert!(compiled.sql.contains("strftime('%Y-%m-%d %H:%M:%f', 'now')"));
        // 4 params for the first row, 3 for the now() row
        assert_eq!(compiled.params.len(), 7);
        assert!(matches!(compiled.params[5], SqlValue::Null));
    }

    #[test]
    fn test_append_skips_invalid_dates() {
        let payload: AppendPayload = serde_json::from_str(
            r#"{"readings":[
                {"asset_code":"a","user_ts":"not a date","reading":{"v":1}},
                {"asset_code":"b","user_ts":"2024-01-02 03:04:05.1","reading":{"v":2}}]}"#,
        )
        .unwrap();
        let (compiled, rows) = compile_append(&payload).unwrap();
        assert_eq!(rows, 1);
        assert_eq!(compiled.params.len(), 4);
        match &compiled.params[1] {
            SqlValue::Text(t) => assert_eq!(t, "b"),
            other => panic!("expected asset_code param, got {other:?}"),
        }
    }
}
