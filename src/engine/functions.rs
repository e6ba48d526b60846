//! Template functions: remote resource fetchers, raster handles, affine
//! transform construction and the UTC clock.
//!
//! Fetching functions hold the shared [`BlobFetcher`], so they are
//! struct-based [`tera::Function`] implementations rather than free
//! functions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use serde_json::{json, Map, Value};
use tera::Tera;

use crate::engine::fetch::BlobFetcher;
use crate::engine::filters::engine_err;
use crate::engine::raster::{self, FetcherSource};
use crate::error::EngineError;

fn required_str(args: &HashMap<String, Value>, name: &str) -> tera::Result<String> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| tera::Error::msg(format!("missing required argument '{name}'")))
}

fn required_f64(args: &HashMap<String, Value>, name: &str) -> tera::Result<f64> {
    args.get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| tera::Error::msg(format!("missing required numeric argument '{name}'")))
}

/// Current UTC time in ISO 8601 with microseconds, `Z` suffixed.
pub fn now(_args: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(format!(
        "{}Z",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f")
    )))
}

/// Affine georeferencing coefficients from bounds and pixel dimensions.
pub fn affine_transform_from_bounds(args: &HashMap<String, Value>) -> tera::Result<Value> {
    let west = required_f64(args, "west")?;
    let south = required_f64(args, "south")?;
    let east = required_f64(args, "east")?;
    let north = required_f64(args, "north")?;
    let width = required_f64(args, "width")?;
    let height = required_f64(args, "height")?;
    if width <= 0.0 || height <= 0.0 {
        return Err(tera::Error::msg(
            "affine_transform_from_bounds: width and height must be positive",
        ));
    }
    Ok(json!([
        (east - west) / width,
        0.0,
        west,
        0.0,
        (south - north) / height,
        north,
    ]))
}

/// Affine georeferencing coefficients from the upper-left corner and
/// pixel sizes.
pub fn affine_transform_from_origin(args: &HashMap<String, Value>) -> tera::Result<Value> {
    let west = required_f64(args, "west")?;
    let north = required_f64(args, "north")?;
    let xsize = required_f64(args, "xsize")?;
    let ysize = required_f64(args, "ysize")?;
    Ok(json!([xsize, 0.0, west, 0.0, -ysize, north]))
}

pub struct GetText {
    fetcher: Arc<dyn BlobFetcher>,
}

impl tera::Function for GetText {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let url = required_str(args, "url")?;
        let bytes = self.fetcher.fetch(&url).map_err(engine_err)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| tera::Error::msg(format!("resource at {url} is not UTF-8: {e}")))?;
        Ok(Value::String(text))
    }
}

pub struct GetJson {
    fetcher: Arc<dyn BlobFetcher>,
}

impl tera::Function for GetJson {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let url = required_str(args, "url")?;
        let bytes = self.fetcher.fetch(&url).map_err(engine_err)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| tera::Error::msg(format!("resource at {url} is not JSON: {e}")))
    }
}

pub struct GetXml {
    fetcher: Arc<dyn BlobFetcher>,
}

impl tera::Function for GetXml {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let url = required_str(args, "url")?;
        let namespaces: Option<HashMap<String, String>> = args
            .get("namespaces")
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|_| {
                    tera::Error::msg("'namespaces' must map namespace URIs to prefixes")
                })
            })
            .transpose()?;
        let bytes = self.fetcher.fetch(&url).map_err(engine_err)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| tera::Error::msg(format!("resource at {url} is not UTF-8: {e}")))?;
        xml_to_value(&text, namespaces.as_ref())
            .map_err(|e| tera::Error::msg(format!("resource at {url} is not valid XML: {e}")))
    }
}

pub struct GetRasterDataset {
    fetcher: Arc<dyn BlobFetcher>,
}

impl tera::Function for GetRasterDataset {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let url = required_str(args, "url")?;
        let source = FetcherSource::new(Arc::clone(&self.fetcher), &url);
        let dataset = raster::open_dataset(&source, &url).map_err(engine_err)?;
        serde_json::to_value(dataset).map_err(|e| tera::Error::msg(e.to_string()))
    }
}

pub struct GetRasterFileInfo {
    fetcher: Arc<dyn BlobFetcher>,
}

impl tera::Function for GetRasterFileInfo {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let url = required_str(args, "url")?;
        let source = FetcherSource::new(Arc::clone(&self.fetcher), &url);
        let dataset = raster::open_dataset(&source, &url).map_err(engine_err)?;
        raster::raster_file_info(&dataset).map_err(engine_err)
    }
}

/// Converts an XML document to a nested value: attributes become
/// `@name` keys, text content becomes `#text` (or the whole value for
/// leaf elements), repeated siblings collapse into arrays.
///
/// With a namespace map (URI to prefix), element names are rewritten to
/// `prefix:local`; an empty prefix strips the namespace, unmapped
/// namespaces keep `uri:local`.
pub fn xml_to_value(
    text: &str,
    namespaces: Option<&HashMap<String, String>>,
) -> Result<Value, EngineError> {
    let mut reader = NsReader::from_str(text);
    reader.trim_text(true);

    // Stack of (element name, attributes-and-children map).
    let mut stack: Vec<(String, Map<String, Value>)> = vec![(String::new(), Map::new())];
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_resolved_event_into(&mut buf)
            .map_err(|e| EngineError::InvalidArgument(format!("XML parse error: {e}")))?;
        match event {
            (ns, Event::Start(e)) => {
                let name = qualified_name(&ns, e.local_name().as_ref(), namespaces);
                let mut map = Map::new();
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| {
                        EngineError::InvalidArgument(format!("XML attribute error: {e}"))
                    })?;
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = attr.unescape_value().map_err(|e| {
                        EngineError::InvalidArgument(format!("XML attribute error: {e}"))
                    })?;
                    map.insert(key, Value::String(value.to_string()));
                }
                stack.push((name, map));
            }
            (ns, Event::Empty(e)) => {
                let name = qualified_name(&ns, e.local_name().as_ref(), namespaces);
                let mut map = Map::new();
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| {
                        EngineError::InvalidArgument(format!("XML attribute error: {e}"))
                    })?;
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = attr.unescape_value().map_err(|e| {
                        EngineError::InvalidArgument(format!("XML attribute error: {e}"))
                    })?;
                    map.insert(key, Value::String(value.to_string()));
                }
                let parent = stack
                    .last_mut()
                    .ok_or_else(|| EngineError::InvalidArgument("unbalanced XML".to_string()))?;
                insert_child(&mut parent.1, name, finalize_element(map));
            }
            (_, Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| EngineError::InvalidArgument(format!("XML text error: {e}")))?
                    .to_string();
                if !text.is_empty() {
                    let current = stack.last_mut().ok_or_else(|| {
                        EngineError::InvalidArgument("unbalanced XML".to_string())
                    })?;
                    current
                        .1
                        .insert("#text".to_string(), Value::String(text));
                }
            }
            (_, Event::End(_)) => {
                let (name, map) = stack
                    .pop()
                    .ok_or_else(|| EngineError::InvalidArgument("unbalanced XML".to_string()))?;
                let parent = stack
                    .last_mut()
                    .ok_or_else(|| EngineError::InvalidArgument("unbalanced XML".to_string()))?;
                insert_child(&mut parent.1, name, finalize_element(map));
            }
            (_, Event::Eof) => break,
            _ => {}
        }
        buf.clear();
    }

    let (_, root) = stack
        .pop()
        .ok_or_else(|| EngineError::InvalidArgument("empty XML document".to_string()))?;
    Ok(Value::Object(root))
}

fn qualified_name(
    ns: &ResolveResult,
    local: &[u8],
    namespaces: Option<&HashMap<String, String>>,
) -> String {
    let local = String::from_utf8_lossy(local).to_string();
    let Some(namespaces) = namespaces else {
        return local;
    };
    match ns {
        ResolveResult::Bound(uri) => {
            let uri = String::from_utf8_lossy(uri.as_ref()).to_string();
            match namespaces.get(&uri) {
                Some(prefix) if prefix.is_empty() => local,
                Some(prefix) => format!("{prefix}:{local}"),
                None => format!("{uri}:{local}"),
            }
        }
        _ => local,
    }
}

/// A leaf element with only text collapses to its text value.
fn finalize_element(map: Map<String, Value>) -> Value {
    if map.is_empty() {
        return Value::Null;
    }
    if map.len() == 1 {
        if let Some(text) = map.get("#text") {
            return text.clone();
        }
    }
    Value::Object(map)
}

fn insert_child(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}

/// Registers every function on the environment.
pub fn register_functions(tera: &mut Tera, fetcher: Arc<dyn BlobFetcher>) {
    tera.register_function("now", now);
    tera.register_function("affine_transform_from_bounds", affine_transform_from_bounds);
    tera.register_function("affine_transform_from_origin", affine_transform_from_origin);
    tera.register_function(
        "get_text",
        GetText {
            fetcher: Arc::clone(&fetcher),
        },
    );
    tera.register_function(
        "get_json",
        GetJson {
            fetcher: Arc::clone(&fetcher),
        },
    );
    tera.register_function(
        "get_xml",
        GetXml {
            fetcher: Arc::clone(&fetcher),
        },
    );
    tera.register_function(
        "get_raster_dataset",
        GetRasterDataset {
            fetcher: Arc::clone(&fetcher),
        },
    );
    tera.register_function("get_raster_file_info", GetRasterFileInfo { fetcher });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fetch::MemoryFetcher;

    #[test]
    fn now_is_iso8601_zulu() {
        let stamp = now(&HashMap::new()).unwrap();
        let s = stamp.as_str().unwrap();
        assert!(s.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(s).is_ok());
    }

    #[test]
    fn affine_from_bounds() {
        let mut args = HashMap::new();
        args.insert("west".to_string(), json!(0.0));
        args.insert("south".to_string(), json!(0.0));
        args.insert("east".to_string(), json!(100.0));
        args.insert("north".to_string(), json!(50.0));
        args.insert("width".to_string(), json!(100));
        args.insert("height".to_string(), json!(50));
        let out = affine_transform_from_bounds(&args).unwrap();
        assert_eq!(out, json!([1.0, 0.0, 0.0, 0.0, -1.0, 50.0]));
    }

    #[test]
    fn affine_from_origin() {
        let mut args = HashMap::new();
        args.insert("west".to_string(), json!(500000.0));
        args.insert("north".to_string(), json!(4100000.0));
        args.insert("xsize".to_string(), json!(10.0));
        args.insert("ysize".to_string(), json!(10.0));
        let out = affine_transform_from_origin(&args).unwrap();
        assert_eq!(out, json!([10.0, 0.0, 500000.0, 0.0, -10.0, 4100000.0]));
    }

    #[test]
    fn get_text_reads_resource() {
        use tera::Function;
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert("https://x/meta.txt", "hello");
        let f = GetText {
            fetcher: fetcher.clone(),
        };
        let mut args = HashMap::new();
        args.insert("url".to_string(), json!("https://x/meta.txt"));
        assert_eq!(f.call(&args).unwrap(), json!("hello"));

        args.insert("url".to_string(), json!("https://x/missing.txt"));
        assert!(f.call(&args).is_err());
    }

    #[test]
    fn xml_basic_shape() {
        let value = xml_to_value(
            r#"<scene id="42"><band>red</band><band>nir</band><cloud_cover>3.5</cloud_cover></scene>"#,
            None,
        )
        .unwrap();
        assert_eq!(value["scene"]["@id"], json!("42"));
        assert_eq!(value["scene"]["band"], json!(["red", "nir"]));
        assert_eq!(value["scene"]["cloud_cover"], json!("3.5"));
    }

    #[test]
    fn xml_namespace_mapping() {
        let doc = r#"<m:meta xmlns:m="https://example.com/meta"><m:name>s1</m:name></m:meta>"#;
        let mut namespaces = HashMap::new();
        namespaces.insert("https://example.com/meta".to_string(), "md".to_string());
        let value = xml_to_value(doc, Some(&namespaces)).unwrap();
        assert_eq!(value["md:meta"]["md:name"], json!("s1"));

        // Without a map the raw local names are used.
        let plain = xml_to_value(doc, None).unwrap();
        assert_eq!(plain["meta"]["name"], json!("s1"));
    }

    #[test]
    fn xml_empty_element() {
        let value = xml_to_value(r#"<a><b/><c attr="1"/></a>"#, None).unwrap();
        assert_eq!(value["a"]["b"], Value::Null);
        assert_eq!(value["a"]["c"]["@attr"], json!("1"));
    }
}
