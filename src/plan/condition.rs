//! Skip Conditions
//!
//! A deliberately small expression language for `skip_condition`:
//!
//! ```text
//! true | false
//! <operand> == <operand>
//! <operand> != <operand>
//!
//! operand := 'quoted' | "quoted" | setup.<key> | outcome.<identifier>.<name> | bare-word
//! ```
//!
//! `setup.*` reads the ambiance's setup abstractions, `outcome.*` reads
//! outcomes published by nodes that already ran in the same plan execution.

use std::collections::HashMap;

use serde_json::Value;

use super::ambiance::Ambiance;

/// Outcomes of finished nodes, keyed by node identifier then outcome name.
pub type OutcomeMap = HashMap<String, HashMap<String, Value>>;

/// Evaluates a skip condition.
///
/// Returns an error message for malformed expressions or references to
/// values that do not exist.
pub fn evaluate(expression: &str, ambiance: &Ambiance, outcomes: &OutcomeMap) -> Result<bool, String> {
    let expression = expression.trim();

    match expression {
        "true" => return Ok(true),
        "false" => return Ok(false),
        _ => {}
    }

    let (lhs, rhs, negate) = if let Some((l, r)) = expression.split_once("!=") {
        (l, r, true)
    } else if let Some((l, r)) = expression.split_once("==") {
        (l, r, false)
    } else {
        return Err(format!("Unsupported skip condition: '{}'", expression));
    };

    let lhs = resolve(lhs.trim(), ambiance, outcomes)?;
    let rhs = resolve(rhs.trim(), ambiance, outcomes)?;

    Ok((lhs == rhs) != negate)
}

/// Resolves one operand to its string form.
fn resolve(operand: &str, ambiance: &Ambiance, outcomes: &OutcomeMap) -> Result<String, String> {
    if operand.is_empty() {
        return Err("Empty operand in skip condition".to_string());
    }

    for quote in ['\'', '"'] {
        if operand.len() >= 2 && operand.starts_with(quote) && operand.ends_with(quote) {
            return Ok(operand[1..operand.len() - 1].to_string());
        }
    }

    if let Some(key) = operand.strip_prefix("setup.") {
        return ambiance
            .setup_abstraction(key)
            .map(str::to_string)
            .ok_or_else(|| format!("Unknown setup abstraction '{}'", key));
    }

    if let Some(path) = operand.strip_prefix("outcome.") {
        let (identifier, name) = path
            .split_once('.')
            .ok_or_else(|| format!("Outcome reference '{}' needs <identifier>.<name>", operand))?;

        let value = outcomes
            .get(identifier)
            .and_then(|named| named.get(name))
            .ok_or_else(|| format!("Unknown outcome '{}'", path))?;

        return Ok(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }

    Ok(operand.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ambiance() -> Ambiance {
        let mut setup = BTreeMap::new();
        setup.insert("env".to_string(), "prod".to_string());
        Ambiance::new("plan-1", setup, 1)
    }

    fn outcomes() -> OutcomeMap {
        let mut build = HashMap::new();
        build.insert("artifact".to_string(), json!("svc-1.2.tar"));
        build.insert("tests".to_string(), json!(12));
        let mut map = HashMap::new();
        map.insert("build".to_string(), build);
        map
    }

    #[test]
    fn test_literals() {
        assert_eq!(evaluate("true", &ambiance(), &outcomes()), Ok(true));
        assert_eq!(evaluate(" false ", &ambiance(), &outcomes()), Ok(false));
    }

    #[test]
    fn test_setup_comparison() {
        assert_eq!(evaluate("setup.env == 'prod'", &ambiance(), &outcomes()), Ok(true));
        assert_eq!(evaluate("setup.env != prod", &ambiance(), &outcomes()), Ok(false));
        assert_eq!(evaluate("setup.env == \"qa\"", &ambiance(), &outcomes()), Ok(false));
    }

    #[test]
    fn test_outcome_comparison() {
        assert_eq!(
            evaluate("outcome.build.artifact == 'svc-1.2.tar'", &ambiance(), &outcomes()),
            Ok(true)
        );
        assert_eq!(evaluate("outcome.build.tests == 12", &ambiance(), &outcomes()), Ok(true));
    }

    #[test]
    fn test_unknown_references() {
        let err = evaluate("setup.region == eu", &ambiance(), &outcomes()).unwrap_err();
        assert!(err.contains("region"));

        let err = evaluate("outcome.deploy.url == x", &ambiance(), &outcomes()).unwrap_err();
        assert!(err.contains("deploy.url"));

        let err = evaluate("outcome.build == x", &ambiance(), &outcomes()).unwrap_err();
        assert!(err.contains("<identifier>.<name>"));
    }

    #[test]
    fn test_unsupported_expression() {
        assert!(evaluate("setup.env > 3", &ambiance(), &outcomes()).is_err());
        assert!(evaluate("== x", &ambiance(), &outcomes()).is_err());
    }
}
