//! Template tests: string predicates usable as `is`-style selectors.

use serde_json::Value;
use tera::Tera;

fn tested_str<'a>(value: Option<&'a Value>, test: &str) -> tera::Result<&'a str> {
    value
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg(format!("{test}: tested value is not a string")))
}

fn param_str<'a>(params: &'a [Value], test: &str) -> tera::Result<&'a str> {
    params
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg(format!("{test}: expected one string argument")))
}

pub fn starts_with(value: Option<&Value>, params: &[Value]) -> tera::Result<bool> {
    Ok(tested_str(value, "starts_with")?.starts_with(param_str(params, "starts_with")?))
}

pub fn ends_with(value: Option<&Value>, params: &[Value]) -> tera::Result<bool> {
    Ok(tested_str(value, "ends_with")?.ends_with(param_str(params, "ends_with")?))
}

pub fn contains(value: Option<&Value>, params: &[Value]) -> tera::Result<bool> {
    Ok(tested_str(value, "contains")?.contains(param_str(params, "contains")?))
}

/// Registers every test on the environment.
pub fn register_testers(tera: &mut Tera) {
    tera.register_tester("starts_with", starts_with);
    tera.register_tester("ends_with", ends_with);
    tera.register_tester("contains", contains);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_predicates() {
        let value = json!("S2A_MSIL2A_20240601.tif");
        assert!(starts_with(Some(&value), &[json!("S2A")]).unwrap());
        assert!(!starts_with(Some(&value), &[json!("S2B")]).unwrap());
        assert!(ends_with(Some(&value), &[json!(".tif")]).unwrap());
        assert!(contains(Some(&value), &[json!("MSIL2A")]).unwrap());
        assert!(starts_with(None, &[json!("x")]).is_err());
        assert!(contains(Some(&value), &[]).is_err());
    }
}
