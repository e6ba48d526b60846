//! Template filters: regex helpers mirroring Python `re` semantics,
//! geometry manipulation, and raster metadata extraction.
//!
//! Regex filters accept an integer `flags` argument built from the
//! `RE_*` globals; match results are plain objects with `match`,
//! `start`, `end`, `groups` and `named` fields, or null when nothing
//! matched, so templates can test them with `is none`.

use std::collections::HashMap;

use regex::{Captures, Regex, RegexBuilder};
use serde_json::{json, Value};
use tera::Tera;

use crate::engine::geometry;
use crate::engine::proj::Crs;
use crate::engine::raster::{self, RasterDataset};
use crate::error::EngineError;

// Flag bits matching the RE_* globals.
const FLAG_IGNORECASE: i64 = 2;
const FLAG_MULTILINE: i64 = 8;
const FLAG_DOTALL: i64 = 16;
const FLAG_VERBOSE: i64 = 64;
const FLAG_ASCII: i64 = 256;

pub(crate) fn engine_err(e: EngineError) -> tera::Error {
    tera::Error::msg(e.to_string())
}

fn subject(value: &Value, filter: &str) -> tera::Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| tera::Error::msg(format!("{filter}: value is not a string")))
}

/// Collapses Python-style string-literal escapes. Template authors
/// write patterns the way they would in a Python source file
/// (`"\\.tif$"` for the pattern `\.tif$`), but tera delivers literal
/// contents verbatim, so the collapse happens here. Unknown escapes
/// keep their backslash, like Python's.
fn unescape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn str_arg(args: &HashMap<String, Value>, name: &str) -> tera::Result<Option<String>> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(unescape_literal(s))),
        Some(other) => Err(tera::Error::msg(format!(
            "argument '{name}' must be a string, got {other}"
        ))),
    }
}

fn required_str_arg(args: &HashMap<String, Value>, name: &str) -> tera::Result<String> {
    str_arg(args, name)?
        .ok_or_else(|| tera::Error::msg(format!("missing required argument '{name}'")))
}

fn int_arg(args: &HashMap<String, Value>, name: &str, default: i64) -> tera::Result<i64> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value.as_i64().ok_or_else(|| {
            tera::Error::msg(format!("argument '{name}' must be an integer, got {value}"))
        }),
    }
}

fn bool_arg(args: &HashMap<String, Value>, name: &str, default: bool) -> tera::Result<bool> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value.as_bool().ok_or_else(|| {
            tera::Error::msg(format!("argument '{name}' must be a boolean, got {value}"))
        }),
    }
}

fn compile(pattern: &str, flags: i64) -> tera::Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags & FLAG_IGNORECASE != 0)
        .multi_line(flags & FLAG_MULTILINE != 0)
        .dot_matches_new_line(flags & FLAG_DOTALL != 0)
        .ignore_whitespace(flags & FLAG_VERBOSE != 0)
        .unicode(flags & FLAG_ASCII == 0)
        .build()
        .map_err(|e| tera::Error::msg(format!("invalid pattern '{pattern}': {e}")))
}

fn match_to_value(re: &Regex, caps: &Captures) -> Value {
    let whole = match caps.get(0) {
        Some(m) => m,
        None => return Value::Null,
    };
    let groups: Vec<Value> = (1..caps.len())
        .map(|i| {
            caps.get(i)
                .map(|g| Value::String(g.as_str().to_string()))
                .unwrap_or(Value::Null)
        })
        .collect();
    let named: serde_json::Map<String, Value> = re
        .capture_names()
        .flatten()
        .map(|name| {
            (
                name.to_string(),
                caps.name(name)
                    .map(|g| Value::String(g.as_str().to_string()))
                    .unwrap_or(Value::Null),
            )
        })
        .collect();
    json!({
        "match": whole.as_str(),
        "start": whole.start(),
        "end": whole.end(),
        "groups": groups,
        "named": named,
    })
}

/// Rewrites Python-style backreferences (`\1`, `\g<name>`) into the
/// `${...}` form the regex crate expects, escaping literal dollars.
fn convert_replacement(repl: &str) -> String {
    let mut out = String::new();
    let mut chars = repl.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut num = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        num.push(d);
                        chars.next();
                    }
                    out.push_str("${");
                    out.push_str(&num);
                    out.push('}');
                }
                Some('g') => {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        let mut name = String::new();
                        for d in chars.by_ref() {
                            if d == '>' {
                                break;
                            }
                            name.push(d);
                        }
                        out.push_str("${");
                        out.push_str(&name);
                        out.push('}');
                    } else {
                        out.push('g');
                    }
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('t') => {
                    chars.next();
                    out.push('\t');
                }
                _ => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    out
}

pub fn regex_match(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = subject(value, "regex_match")?;
    let pattern = required_str_arg(args, "pattern")?;
    let flags = int_arg(args, "flags", 0)?;
    let re = compile(&format!(r"\A(?:{pattern})"), flags)?;
    Ok(re
        .captures(&text)
        .map(|caps| match_to_value(&re, &caps))
        .unwrap_or(Value::Null))
}

pub fn regex_fullmatch(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = subject(value, "regex_fullmatch")?;
    let pattern = required_str_arg(args, "pattern")?;
    let flags = int_arg(args, "flags", 0)?;
    let re = compile(&format!(r"\A(?:{pattern})\z"), flags)?;
    Ok(re
        .captures(&text)
        .map(|caps| match_to_value(&re, &caps))
        .unwrap_or(Value::Null))
}

pub fn regex_search(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = subject(value, "regex_search")?;
    let pattern = required_str_arg(args, "pattern")?;
    let flags = int_arg(args, "flags", 0)?;
    let re = compile(&pattern, flags)?;
    Ok(re
        .captures(&text)
        .map(|caps| match_to_value(&re, &caps))
        .unwrap_or(Value::Null))
}

pub fn regex_sub(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = subject(value, "regex_sub")?;
    let pattern = required_str_arg(args, "pattern")?;
    let repl = convert_replacement(&required_str_arg(args, "repl")?);
    let count = int_arg(args, "count", 0)?.max(0) as usize;
    let flags = int_arg(args, "flags", 0)?;
    let re = compile(&pattern, flags)?;
    Ok(Value::String(
        re.replacen(&text, count, repl.as_str()).into_owned(),
    ))
}

pub fn regex_subn(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = subject(value, "regex_subn")?;
    let pattern = required_str_arg(args, "pattern")?;
    let repl = convert_replacement(&required_str_arg(args, "repl")?);
    let count = int_arg(args, "count", 0)?.max(0) as usize;
    let flags = int_arg(args, "flags", 0)?;
    let re = compile(&pattern, flags)?;
    let limit = if count == 0 { usize::MAX } else { count };
    let replacements = re.find_iter(&text).take(limit).count();
    let replaced = re.replacen(&text, count, repl.as_str()).into_owned();
    Ok(json!([replaced, replacements]))
}

pub fn regex_split(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = subject(value, "regex_split")?;
    let pattern = required_str_arg(args, "pattern")?;
    let maxsplit = int_arg(args, "maxsplit", 0)?.max(0) as usize;
    let flags = int_arg(args, "flags", 0)?;
    let re = compile(&pattern, flags)?;

    let mut parts = Vec::new();
    let mut last = 0;
    for (i, caps) in re.captures_iter(&text).enumerate() {
        if maxsplit > 0 && i >= maxsplit {
            break;
        }
        let Some(whole) = caps.get(0) else { continue };
        parts.push(Value::String(text[last..whole.start()].to_string()));
        // Captured group text joins the result list, like Python's split.
        for g in 1..caps.len() {
            parts.push(
                caps.get(g)
                    .map(|m| Value::String(m.as_str().to_string()))
                    .unwrap_or(Value::Null),
            );
        }
        last = whole.end();
    }
    parts.push(Value::String(text[last..].to_string()));
    Ok(Value::Array(parts))
}

pub fn regex_findall(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = subject(value, "regex_findall")?;
    let pattern = required_str_arg(args, "pattern")?;
    let flags = int_arg(args, "flags", 0)?;
    let re = compile(&pattern, flags)?;

    let group_count = re.captures_len() - 1;
    let matches: Vec<Value> = re
        .captures_iter(&text)
        .map(|caps| match group_count {
            0 => Value::String(
                caps.get(0)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            ),
            1 => Value::String(
                caps.get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            ),
            _ => Value::Array(
                (1..caps.len())
                    .map(|g| {
                        Value::String(
                            caps.get(g)
                                .map(|m| m.as_str().to_string())
                                .unwrap_or_default(),
                        )
                    })
                    .collect(),
            ),
        })
        .collect();
    Ok(Value::Array(matches))
}

pub fn regex_finditer(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = subject(value, "regex_finditer")?;
    let pattern = required_str_arg(args, "pattern")?;
    let flags = int_arg(args, "flags", 0)?;
    let re = compile(&pattern, flags)?;
    Ok(Value::Array(
        re.captures_iter(&text)
            .map(|caps| match_to_value(&re, &caps))
            .collect(),
    ))
}

pub fn shape_from_footprint(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let footprint: Vec<f64> = value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_f64).collect())
        .ok_or_else(|| tera::Error::msg("shape_from_footprint: value is not a number list"))?;
    let rounding = int_arg(args, "rounding", 6)?;
    geometry::shape_from_footprint(&footprint, rounding).map_err(engine_err)
}

pub fn bbox(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let bbox = geometry::bbox_of(value).map_err(engine_err)?;
    Ok(json!(bbox.to_vec()))
}

pub fn centroid(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    geometry::centroid(value).map_err(engine_err)
}

pub fn simplify(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let tolerance = args
        .get("tolerance")
        .and_then(Value::as_f64)
        .ok_or_else(|| tera::Error::msg("simplify: missing numeric 'tolerance'"))?;
    let preserve_topology = bool_arg(args, "preserve_topology", true)?;
    geometry::simplify(value, tolerance, preserve_topology).map_err(engine_err)
}

fn crs_arg(args: &HashMap<String, Value>, name: &str) -> tera::Result<Crs> {
    let crs = match args.get(name) {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| tera::Error::msg(format!("invalid EPSG code in '{name}'")))
            .and_then(|code| {
                Crs::from_epsg(code as u32).map_err(|e| tera::Error::msg(e.to_string()))
            })?,
        Some(Value::String(s)) => Crs::parse(s).map_err(|e| tera::Error::msg(e.to_string()))?,
        _ => {
            return Err(tera::Error::msg(format!(
                "missing coordinate system argument '{name}'"
            )))
        }
    };
    Ok(crs)
}

pub fn transform(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let src = crs_arg(args, "src_crs")?;
    let dst = crs_arg(args, "dst_crs")?;
    let precision = int_arg(args, "precision", -1)?;
    geometry::transform_geom(value, src, dst, precision).map_err(engine_err)
}

pub fn tojson(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let indent = int_arg(args, "indent", 0)?;
    let rendered = if indent > 0 {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|e| tera::Error::msg(e.to_string()))?;
    Ok(Value::String(rendered))
}

fn dataset_from(value: &Value, filter: &str) -> tera::Result<RasterDataset> {
    serde_json::from_value(value.clone())
        .map_err(|e| tera::Error::msg(format!("{filter}: value is not a raster dataset: {e}")))
}

pub fn projection_info(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let dataset = dataset_from(value, "projection_info")?;
    Ok(raster::projection_info(&dataset))
}

pub fn geometry_info(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let dataset = dataset_from(value, "geometry_info")?;
    let densify_pts = int_arg(args, "densify_pts", 0)?;
    if densify_pts < 0 {
        return Err(tera::Error::msg("geometry_info: 'densify_pts' must be positive"));
    }
    let precision = int_arg(args, "precision", -1)?;
    raster::geometry_info(&dataset, densify_pts as usize, precision).map_err(engine_err)
}

pub fn raster_info(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let dataset = dataset_from(value, "raster_info")?;
    Ok(raster::raster_info(&dataset))
}

pub fn eo_bands_info(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let dataset = dataset_from(value, "eo_bands_info")?;
    Ok(raster::eo_bands_info(&dataset))
}

/// Registers every filter on the environment.
pub fn register_filters(tera: &mut Tera) {
    tera.register_filter("regex_match", regex_match);
    tera.register_filter("regex_fullmatch", regex_fullmatch);
    tera.register_filter("regex_search", regex_search);
    tera.register_filter("regex_sub", regex_sub);
    tera.register_filter("regex_subn", regex_subn);
    tera.register_filter("regex_split", regex_split);
    tera.register_filter("regex_findall", regex_findall);
    tera.register_filter("regex_finditer", regex_finditer);
    tera.register_filter("shape_from_footprint", shape_from_footprint);
    tera.register_filter("bbox", bbox);
    tera.register_filter("centroid", centroid);
    tera.register_filter("simplify", simplify);
    tera.register_filter("transform", transform);
    tera.register_filter("tojson", tojson);
    tera.register_filter("projection_info", projection_info);
    tera.register_filter("geometry_info", geometry_info);
    tera.register_filter("raster_info", raster_info);
    tera.register_filter("eo_bands_info", eo_bands_info);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn sub_with_ignorecase_flag() {
        let out = regex_sub(
            &json!("Baked Beans And Spam"),
            &args(&[
                ("pattern", json!(r"\sAND\s")),
                ("repl", json!(" & ")),
                ("flags", json!(FLAG_IGNORECASE)),
            ]),
        )
        .unwrap();
        assert_eq!(out, json!("Baked Beans & Spam"));
    }

    #[test]
    fn pattern_escapes_collapse_like_string_literals() {
        // A template written `pattern="\\.tif$"` reaches the filter with
        // both backslashes intact; they must collapse to `\.tif$`.
        let out = regex_sub(
            &json!("scene.tif"),
            &args(&[("pattern", json!(r"\\.tif$")), ("repl", json!(""))]),
        )
        .unwrap();
        assert_eq!(out, json!("scene"));

        let out = regex_sub(
            &json!("Baked Beans And Spam"),
            &args(&[
                ("pattern", json!(r"\\sAND\\s")),
                ("repl", json!(" & ")),
                ("flags", json!(FLAG_IGNORECASE)),
            ]),
        )
        .unwrap();
        assert_eq!(out, json!("Baked Beans & Spam"));

        // Unknown escapes keep their backslash, so `\d` still means a
        // digit class whether or not the author doubled it.
        let doubled =
            regex_findall(&json!("a1 b2"), &args(&[("pattern", json!(r"\\d"))])).unwrap();
        let single = regex_findall(&json!("a1 b2"), &args(&[("pattern", json!(r"\d"))])).unwrap();
        assert_eq!(doubled, json!(["1", "2"]));
        assert_eq!(doubled, single);
    }

    #[test]
    fn repl_escapes_collapse_before_backreferences() {
        // `repl="\\2-\\1"` from a template must behave like Python's
        // re.sub replacement `\2-\1`.
        let out = regex_sub(
            &json!("scene_2024_06"),
            &args(&[
                ("pattern", json!(r"scene_(\\d+)_(\\d+)")),
                ("repl", json!(r"\\2-\\1")),
            ]),
        )
        .unwrap();
        assert_eq!(out, json!("06-2024"));
    }

    #[test]
    fn sub_backreference_conversion() {
        let out = regex_sub(
            &json!("scene_2024_06"),
            &args(&[
                ("pattern", json!(r"scene_(\d+)_(\d+)")),
                ("repl", json!(r"\2-\1")),
            ]),
        )
        .unwrap();
        assert_eq!(out, json!("06-2024"));
    }

    #[test]
    fn sub_respects_count() {
        let out = regex_sub(
            &json!("a.b.c.d"),
            &args(&[
                ("pattern", json!(r"\.")),
                ("repl", json!("-")),
                ("count", json!(2)),
            ]),
        )
        .unwrap();
        assert_eq!(out, json!("a-b-c.d"));
    }

    #[test]
    fn subn_reports_replacement_count() {
        let out = regex_subn(
            &json!("a.b.c"),
            &args(&[("pattern", json!(r"\.")), ("repl", json!("-"))]),
        )
        .unwrap();
        assert_eq!(out, json!(["a-b-c", 2]));
    }

    #[test]
    fn match_anchors_at_start() {
        let found = regex_match(
            &json!("S2A_MSIL2A_20240601"),
            &args(&[("pattern", json!(r"S2([AB])_(\w+?)_(\d{8})"))]),
        )
        .unwrap();
        assert_eq!(found["groups"][0], json!("A"));
        assert_eq!(found["groups"][2], json!("20240601"));

        let missed = regex_match(
            &json!("X_S2A_MSIL2A"),
            &args(&[("pattern", json!(r"S2[AB]"))]),
        )
        .unwrap();
        assert_eq!(missed, Value::Null);
    }

    #[test]
    fn fullmatch_requires_whole_string() {
        let a = args(&[("pattern", json!(r"\w+\.tif"))]);
        assert_ne!(regex_fullmatch(&json!("scene.tif"), &a).unwrap(), Value::Null);
        assert_eq!(
            regex_fullmatch(&json!("scene.tif.bak"), &a).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn search_finds_anywhere() {
        let found = regex_search(
            &json!("path/to/item123.tif"),
            &args(&[("pattern", json!(r"item(\d+)"))]),
        )
        .unwrap();
        assert_eq!(found["named"], json!({}));
        assert_eq!(found["groups"][0], json!("123"));
        assert_eq!(found["match"], json!("item123"));
    }

    #[test]
    fn split_includes_groups_and_maxsplit() {
        let out = regex_split(
            &json!("a1b2c3d"),
            &args(&[("pattern", json!(r"(\d)")), ("maxsplit", json!(2))]),
        )
        .unwrap();
        assert_eq!(out, json!(["a", "1", "b", "2", "c3d"]));
    }

    #[test]
    fn findall_group_arities() {
        let plain = regex_findall(&json!("a1 b2"), &args(&[("pattern", json!(r"\w\d"))])).unwrap();
        assert_eq!(plain, json!(["a1", "b2"]));

        let single =
            regex_findall(&json!("a1 b2"), &args(&[("pattern", json!(r"\w(\d)"))])).unwrap();
        assert_eq!(single, json!(["1", "2"]));

        let multi =
            regex_findall(&json!("a1 b2"), &args(&[("pattern", json!(r"(\w)(\d)"))])).unwrap();
        assert_eq!(multi, json!([["a", "1"], ["b", "2"]]));
    }

    #[test]
    fn finditer_yields_match_objects() {
        let out = regex_finditer(&json!("a1 b2"), &args(&[("pattern", json!(r"\d"))])).unwrap();
        assert_eq!(out[0]["match"], json!("1"));
        assert_eq!(out[1]["start"], json!(4));
    }

    #[test]
    fn transform_filter_accepts_epsg_ints_and_strings() {
        let geom = json!({"type": "Point", "coordinates": [500000.0, 0.0]});
        let by_int = transform(
            &geom,
            &args(&[
                ("src_crs", json!(32633)),
                ("dst_crs", json!(4326)),
                ("precision", json!(4)),
            ]),
        )
        .unwrap();
        let by_str = transform(
            &geom,
            &args(&[
                ("src_crs", json!("EPSG:32633")),
                ("dst_crs", json!("EPSG:4326")),
                ("precision", json!(4)),
            ]),
        )
        .unwrap();
        assert_eq!(by_int, by_str);
        assert_eq!(by_int["coordinates"], json!([15.0, 0.0]));
    }

    #[test]
    fn tojson_compact_and_indented() {
        let value = json!({"a": 1});
        let compact = tojson(&value, &HashMap::new()).unwrap();
        assert_eq!(compact, json!(r#"{"a":1}"#));
        let pretty = tojson(&value, &args(&[("indent", json!(2))])).unwrap();
        assert!(pretty.as_str().unwrap().contains('\n'));
    }
}
