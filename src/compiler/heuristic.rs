//! Keyword-driven development gateway.
//!
//! The real compiler is an out-of-process service. This built-in gateway
//! classifies commands by leading keywords so the server can run end to end
//! against the loopback backend: capabilities, transaction control, simple
//! session mutations, and value-dependent `limit`/`offset` parameters are
//! recognized; everything else is passed through as opaque SQL.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use smallvec::SmallVec;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_128;

use super::{
    CompileRequest, CompiledQuery, CompiledQueryGroup, CompilerGateway, SessionOp, TxControl,
};
use crate::errors::QueryError;
use crate::protocol::types::{Capabilities, Cardinality};
use crate::session::Scalar;

#[derive(Debug, Default)]
pub struct HeuristicGateway;

impl CompilerGateway for HeuristicGateway {
    fn compile(
        &self,
        request: CompileRequest,
    ) -> BoxFuture<'_, Result<CompiledQueryGroup, QueryError>> {
        async move {
            let mut units: SmallVec<[Arc<CompiledQuery>; 1]> = SmallVec::new();
            for statement in split_statements(&request.query) {
                units.push(Arc::new(compile_statement(&statement, &request)?));
            }
            if units.is_empty() {
                return Err(QueryError::new("empty command text"));
            }
            Ok(CompiledQueryGroup { units })
        }
        .boxed()
    }
}

fn compile_statement(text: &str, request: &CompileRequest) -> Result<CompiledQuery, QueryError> {
    let words = leading_words(text, 2);
    let head = words.first().map(String::as_str).unwrap_or("");
    let second = words.get(1).map(String::as_str).unwrap_or("");

    let (status, capabilities, cardinality, tx_control) = match head {
        "select" | "for" | "with" | "group" => {
            ("SELECT".to_string(), Capabilities::NONE, Cardinality::Many, None)
        }
        "insert" => (
            "INSERT".to_string(),
            Capabilities::MODIFICATIONS,
            Cardinality::Many,
            None,
        ),
        "update" => (
            "UPDATE".to_string(),
            Capabilities::MODIFICATIONS,
            Cardinality::Many,
            None,
        ),
        "delete" => (
            "DELETE".to_string(),
            Capabilities::MODIFICATIONS,
            Cardinality::Many,
            None,
        ),
        "start" if second == "transaction" => (
            "START TRANSACTION".to_string(),
            Capabilities::TRANSACTION,
            Cardinality::NoResult,
            Some(TxControl::Start),
        ),
        "commit" => (
            "COMMIT".to_string(),
            Capabilities::TRANSACTION,
            Cardinality::NoResult,
            Some(TxControl::Commit),
        ),
        "rollback" => (
            "ROLLBACK".to_string(),
            Capabilities::TRANSACTION,
            Cardinality::NoResult,
            Some(TxControl::Rollback),
        ),
        "create" | "alter" | "drop" => (
            format!("{} {}", head.to_uppercase(), second.to_uppercase()),
            Capabilities::DDL,
            Cardinality::NoResult,
            None,
        ),
        "set" | "reset" => (
            format!("{} {}", head.to_uppercase(), second.to_uppercase()),
            Capabilities::SESSION_CONFIG,
            Cardinality::NoResult,
            None,
        ),
        "configure" if second == "instance" => (
            "CONFIGURE INSTANCE".to_string(),
            Capabilities::PERSISTENT_CONFIG,
            Cardinality::NoResult,
            None,
        ),
        "configure" => (
            "CONFIGURE SESSION".to_string(),
            Capabilities::SESSION_CONFIG,
            Cardinality::NoResult,
            None,
        ),
        "" => return Err(QueryError::new("empty command text")),
        _ => {
            return Err(QueryError::syntax(
                format!("unexpected keyword {head:?}"),
                1,
                1,
            ))
        }
    };

    let (param_names, cache_deps_vars) = scan_params(text);
    let session_ops = parse_session_ops(text, head, second)?;

    let input_typedesc_id = if param_names.is_empty() {
        Uuid::nil()
    } else {
        Uuid::from_u128(xxh3_128(param_names.join(",").as_bytes()))
    };
    let output_typedesc_id = Uuid::from_u128(xxh3_128(
        format!("{}\0{:?}", text, request.output_format).as_bytes(),
    ));

    Ok(CompiledQuery {
        sql: Bytes::from(text.to_string()),
        status,
        capabilities,
        cardinality,
        input_typedesc_id,
        input_typedesc: Bytes::new(),
        output_typedesc_id,
        output_typedesc: Bytes::new(),
        state_typedesc_id: Uuid::nil(),
        param_names,
        cache_deps_vars,
        tx_control,
        session_ops,
    })
}

/// Split a script on top-level semicolons, respecting single quotes.
fn split_statements(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    for c in text.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                current.push(c);
            }
            ';' if !in_string => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn leading_words(text: &str, n: usize) -> Vec<String> {
    text.split_whitespace()
        .take(n)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Collect `$name` parameters in first-appearance order, and mark the ones
/// whose values shape the plan: parameters feeding `limit` or `offset`
/// clauses (constant-folded by the planner).
fn scan_params(text: &str) -> (Vec<String>, BTreeSet<String>) {
    let mut names: Vec<String> = Vec::new();
    let mut deps = BTreeSet::new();

    let bytes = text.as_bytes();
    let mut i = 0;
    let mut in_string = false;
    let mut in_cast = false;
    let mut word = String::new();
    let mut last_keyword = String::new();

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if c == '\'' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c.to_ascii_lowercase());
            i += 1;
            continue;
        }
        // Word boundary: words inside a cast never become keywords.
        if !word.is_empty() {
            if in_cast {
                word.clear();
            } else {
                last_keyword = std::mem::take(&mut word);
            }
        }
        match c {
            '\'' => in_string = true,
            '<' => in_cast = true,
            '>' => in_cast = false,
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                if end > start {
                    let name = text[start..end].to_string();
                    if last_keyword == "limit" || last_keyword == "offset" {
                        deps.insert(name.clone());
                    }
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }

    (names, deps)
}

/// Parse the handful of session-mutating statement forms the development
/// gateway understands.
fn parse_session_ops(text: &str, head: &str, second: &str) -> Result<Vec<SessionOp>, QueryError> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let op = match (head, second) {
        ("set", "alias") => {
            // set alias <name> as module <module>
            if words.len() == 6 && words[3].eq_ignore_ascii_case("as") {
                SessionOp::SetAlias(words[2].to_string(), words[5].to_string())
            } else {
                return Err(QueryError::new("malformed SET ALIAS"));
            }
        }
        ("reset", "alias") => {
            if words.len() == 3 {
                SessionOp::UnsetAlias(words[2].to_string())
            } else {
                return Err(QueryError::new("malformed RESET ALIAS"));
            }
        }
        ("set", "global") => {
            // set global <name> := <literal>
            if words.len() >= 5 && words[3] == ":=" {
                SessionOp::SetGlobal(words[2].to_string(), parse_literal(&words[4..].join(" "))?)
            } else {
                return Err(QueryError::new("malformed SET GLOBAL"));
            }
        }
        ("reset", "global") => {
            if words.len() == 3 {
                SessionOp::UnsetGlobal(words[2].to_string())
            } else {
                return Err(QueryError::new("malformed RESET GLOBAL"));
            }
        }
        ("configure", "session") => {
            // configure session set <name> := <literal>
            //                       reset <name>
            match words.get(2).map(|w| w.to_lowercase()).as_deref() {
                Some("set") if words.len() >= 6 && words[4] == ":=" => SessionOp::SetConfig(
                    words[3].to_string(),
                    parse_literal(&words[5..].join(" "))?,
                ),
                Some("reset") if words.len() == 4 => SessionOp::UnsetConfig(words[3].to_string()),
                _ => return Err(QueryError::new("malformed CONFIGURE SESSION")),
            }
        }
        _ => return Ok(Vec::new()),
    };
    Ok(vec![op])
}

fn parse_literal(raw: &str) -> Result<Scalar, QueryError> {
    let raw = raw.trim();
    if raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2 {
        return Ok(Scalar::Str(raw[1..raw.len() - 1].to_string()));
    }
    if raw.eq_ignore_ascii_case("true") {
        return Ok(Scalar::Bool(true));
    }
    if raw.eq_ignore_ascii_case("false") {
        return Ok(Scalar::Bool(false));
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Ok(Scalar::Int(v));
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Ok(Scalar::Float(v));
    }
    Err(QueryError::new(format!("cannot parse literal {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{InputLanguage, OutputFormat, ProtocolVersion};

    fn request(query: &str) -> CompileRequest {
        CompileRequest {
            query: query.to_string(),
            branch: "main".to_string(),
            protocol_version: ProtocolVersion::CURRENT,
            schema_version: 1,
            input_language: InputLanguage::EdgeQl,
            output_format: OutputFormat::Binary,
            expected_cardinality: Cardinality::Many,
            implicit_limit: 0,
            compilation_flags: 0,
            modaliases: Default::default(),
            variables: Vec::new(),
        }
    }

    async fn compile(query: &str) -> CompiledQueryGroup {
        HeuristicGateway.compile(request(query)).await.unwrap()
    }

    #[tokio::test]
    async fn test_select_classification() {
        let group = compile("select 1").await;
        let unit = &group.units[0];
        assert_eq!(unit.status, "SELECT");
        assert!(unit.capabilities.is_empty());
        assert!(unit.tx_control.is_none());
    }

    #[tokio::test]
    async fn test_ddl_classification() {
        let group = compile("create type Foo").await;
        assert_eq!(group.units[0].capabilities, Capabilities::DDL);
        assert_eq!(group.units[0].status, "CREATE TYPE");
    }

    #[tokio::test]
    async fn test_transaction_control() {
        assert_eq!(
            compile("start transaction").await.units[0].tx_control,
            Some(TxControl::Start)
        );
        assert_eq!(
            compile("commit").await.units[0].tx_control,
            Some(TxControl::Commit)
        );
        assert_eq!(
            compile("rollback").await.units[0].tx_control,
            Some(TxControl::Rollback)
        );
    }

    #[tokio::test]
    async fn test_limit_param_is_value_dependent() {
        let group = compile("select Post limit <int64>$n").await;
        let unit = &group.units[0];
        assert_eq!(unit.param_names, vec!["n"]);
        assert!(unit.cache_deps_vars.contains("n"));
    }

    #[tokio::test]
    async fn test_filter_param_is_not_value_dependent() {
        let group = compile("select Post filter .id = <uuid>$id limit <int64>$n").await;
        let unit = &group.units[0];
        assert_eq!(unit.param_names, vec!["id", "n"]);
        assert_eq!(
            unit.cache_deps_vars.iter().collect::<Vec<_>>(),
            vec![&"n".to_string()]
        );
    }

    #[tokio::test]
    async fn test_session_ops() {
        let group = compile("set global tenant := 'acme'").await;
        assert_eq!(
            group.units[0].session_ops,
            vec![SessionOp::SetGlobal(
                "tenant".to_string(),
                Scalar::Str("acme".to_string())
            )]
        );

        let group = compile("configure session set query_log := true").await;
        assert_eq!(
            group.units[0].session_ops,
            vec![SessionOp::SetConfig("query_log".to_string(), Scalar::Bool(true))]
        );
        assert_eq!(group.units[0].capabilities, Capabilities::SESSION_CONFIG);
    }

    #[tokio::test]
    async fn test_script_splits_into_units() {
        let group = compile("select 1; select 2").await;
        assert_eq!(group.units.len(), 2);
        // Quoted semicolons do not split.
        let group = compile("select 'a;b'").await;
        assert_eq!(group.units.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_keyword_is_query_error() {
        let err = HeuristicGateway
            .compile(request("frobnicate now"))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::INVALID_SYNTAX);
    }
}
