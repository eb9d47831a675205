//! SQL parameter-style normalization.
//!
//! Public callers may write either `$N`-style placeholders (PostgreSQL
//! habit, with reuse allowed) or plain `?` placeholders. Everything is
//! translated to `?`-style at this boundary before reaching SQLite:
//!
//! - a reused `$N` expands to repeated `?` with repeated bindings;
//! - `= ANY($N)` where `$N` binds an array expands to `IN (?, ?, ...)`;
//! - an empty array yields an always-false predicate, never `IN ()`.

use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};

use crate::domain::errors::{CoreError, CoreResult};

/// Normalize `sql` + `params` into `?`-style SQL and a flat scalar bind list.
pub fn normalize(sql: &str, params: &[Value]) -> CoreResult<(String, Vec<Value>)> {
    if !sql.contains('$') {
        // Already ?-style; arrays make no sense without an ANY clause.
        if let Some(arr) = params.iter().find(|p| p.is_array()) {
            return Err(CoreError::Invalid(format!(
                "array parameter {arr} requires an '= ANY($n)' clause"
            )));
        }
        return Ok((sql.to_string(), params.to_vec()));
    }

    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut binds: Vec<Value> = Vec::with_capacity(params.len());
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        // Copy string literals verbatim, honoring the '' escape.
        if c == '\'' {
            out.push(c);
            i += 1;
            while i < bytes.len() {
                out.push(bytes[i] as char);
                if bytes[i] == b'\'' {
                    if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                        out.push('\'');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            continue;
        }

        if c == '=' {
            if let Some((idx, next)) = match_any_clause(sql, i) {
                let param = lookup(params, idx)?;
                let items = param.as_array().ok_or_else(|| {
                    CoreError::Invalid(format!("parameter ${idx} used with ANY() must be an array"))
                })?;
                if items.is_empty() {
                    // Membership in the empty set: always false, still a
                    // well-formed predicate after the column reference.
                    out.push_str("IN (SELECT 1 WHERE 1 = 0)");
                } else {
                    out.push_str("IN (");
                    for (n, item) in items.iter().enumerate() {
                        if n > 0 {
                            out.push_str(", ");
                        }
                        out.push('?');
                        binds.push(item.clone());
                    }
                    out.push(')');
                }
                i = next;
                continue;
            }
        }

        if c == '$' {
            if let Some((idx, next)) = parse_placeholder(sql, i) {
                let param = lookup(params, idx)?;
                if param.is_array() {
                    return Err(CoreError::Invalid(format!(
                        "array parameter ${idx} may only appear in an '= ANY($n)' clause"
                    )));
                }
                out.push('?');
                binds.push(param.clone());
                i = next;
                continue;
            }
        }

        out.push(c);
        i += 1;
    }

    Ok((out, binds))
}

/// Bind a flat list of scalar JSON values onto a sqlx query.
pub fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &'q [Value],
) -> CoreResult<Query<'q, Sqlite, SqliteArguments<'q>>> {
    for value in values {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(i64::from(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else if let Some(f) = n.as_f64() {
                    query.bind(f)
                } else {
                    return Err(CoreError::Invalid(format!("unbindable number: {n}")));
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            other => {
                return Err(CoreError::Invalid(format!("unbindable parameter: {other}")));
            }
        };
    }
    Ok(query)
}

/// Parse `$N` starting at `start` (which points at `$`); returns the
/// one-based index and the byte offset just past the digits.
fn parse_placeholder(sql: &str, start: usize) -> Option<(usize, usize)> {
    let bytes = sql.as_bytes();
    let mut end = start + 1;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == start + 1 {
        return None;
    }
    sql[start + 1..end].parse::<usize>().ok().map(|n| (n, end))
}

/// Match `= ANY ( $N )` (case-insensitive, flexible whitespace) beginning
/// at the `=` in position `start`. Returns the placeholder index and the
/// offset just past the closing parenthesis.
fn match_any_clause(sql: &str, start: usize) -> Option<(usize, usize)> {
    let bytes = sql.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    if i + 3 > bytes.len() || !bytes[i..i + 3].eq_ignore_ascii_case(b"ANY") {
        return None;
    }
    i += 3;
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'(' {
        return None;
    }
    i += 1;
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'$' {
        return None;
    }
    let (idx, mut end) = parse_placeholder(sql, i)?;
    while end < bytes.len() && (bytes[end] as char).is_whitespace() {
        end += 1;
    }
    if end >= bytes.len() || bytes[end] != b')' {
        return None;
    }
    Some((idx, end + 1))
}

fn lookup(params: &[Value], one_based: usize) -> CoreResult<&Value> {
    if one_based == 0 || one_based > params.len() {
        return Err(CoreError::Invalid(format!(
            "placeholder ${one_based} has no matching parameter ({} supplied)",
            params.len()
        )));
    }
    Ok(&params[one_based - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn passes_question_style_through() {
        let (sql, binds) = normalize("SELECT * FROM t WHERE a = ? AND b = ?", &[json!(1), json!("x")]).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = ? AND b = ?");
        assert_eq!(binds, vec![json!(1), json!("x")]);
    }

    #[test]
    fn translates_dollar_placeholders() {
        let (sql, binds) = normalize("SELECT * FROM t WHERE a = $1 AND b = $2", &[json!(1), json!("x")]).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = ? AND b = ?");
        assert_eq!(binds, vec![json!(1), json!("x")]);
    }

    #[test]
    fn reused_placeholder_repeats_binding() {
        let (sql, binds) = normalize("SELECT * FROM t WHERE a = $1 OR b = $1", &[json!(7)]).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = ? OR b = ?");
        assert_eq!(binds, vec![json!(7), json!(7)]);
    }

    #[test]
    fn any_clause_expands_to_in_list() {
        let (sql, binds) =
            normalize("SELECT * FROM t WHERE id = ANY($1)", &[json!(["a", "b", "c"])]).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE id IN (?, ?, ?)");
        assert_eq!(binds, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn empty_array_yields_always_false() {
        let (sql, binds) = normalize("SELECT * FROM t WHERE id = ANY($1)", &[json!([])]).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE id IN (SELECT 1 WHERE 1 = 0)");
        assert!(binds.is_empty());
    }

    #[test]
    fn any_clause_is_case_insensitive_and_space_tolerant() {
        let (sql, binds) =
            normalize("SELECT * FROM t WHERE id =  any ( $1 )", &[json!([1, 2])]).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE id IN (?, ?)");
        assert_eq!(binds, vec![json!(1), json!(2)]);
    }

    #[test]
    fn dollar_inside_string_literal_is_untouched() {
        let (sql, binds) = normalize("SELECT '$1' AS lit FROM t WHERE a = $1", &[json!(5)]).unwrap();
        assert_eq!(sql, "SELECT '$1' AS lit FROM t WHERE a = ?");
        assert_eq!(binds, vec![json!(5)]);
    }

    #[test]
    fn array_without_any_clause_is_rejected() {
        assert!(normalize("SELECT * FROM t WHERE id = $1", &[json!([1])]).is_err());
        assert!(normalize("SELECT * FROM t WHERE id = ?", &[json!([1])]).is_err());
    }

    #[test]
    fn missing_parameter_is_rejected() {
        assert!(normalize("SELECT * FROM t WHERE a = $2", &[json!(1)]).is_err());
    }
}
