//! GeoJSON geometry helpers backing the template filter library.
//!
//! Geometries are plain `serde_json::Value` GeoJSON documents so they
//! move through the template engine unchanged. Coordinates are
//! `[lon, lat]` positions.

use serde_json::{json, Value};

use crate::engine::proj::{transform_point, Crs};
use crate::error::EngineError;

/// Rounds to `digits` decimal places; negative digits leave the value
/// untouched.
pub fn round_to(value: f64, digits: i64) -> f64 {
    if digits < 0 {
        return value;
    }
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// Builds a polygon from a flat footprint list.
///
/// Footprint coordinates come as `lat, lon` pairs (the order satellite
/// metadata files use); output positions are `[lon, lat]`. The ring is
/// closed if the input does not repeat its first point.
pub fn shape_from_footprint(footprint: &[f64], rounding: i64) -> Result<Value, EngineError> {
    if footprint.len() < 6 || footprint.len() % 2 != 0 {
        return Err(EngineError::InvalidGeometry(format!(
            "footprint needs an even number of at least 6 coordinates, got {}",
            footprint.len()
        )));
    }
    let mut ring: Vec<Vec<f64>> = footprint
        .chunks(2)
        .map(|pair| {
            vec![
                round_to(pair[1], rounding),
                round_to(pair[0], rounding),
            ]
        })
        .collect();
    if ring.first() != ring.last() {
        let first = ring[0].clone();
        ring.push(first);
    }
    Ok(json!({"type": "Polygon", "coordinates": [ring]}))
}

/// Builds the rectangle polygon of a `[west, south, east, north]` bbox.
pub fn bbox_to_geom(bbox: &[f64; 4]) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[
            [bbox[0], bbox[1]],
            [bbox[2], bbox[1]],
            [bbox[2], bbox[3]],
            [bbox[0], bbox[3]],
            [bbox[0], bbox[1]],
        ]]
    })
}

fn walk_positions(value: &Value, out: &mut Vec<(f64, f64)>) {
    match value {
        Value::Array(items) => {
            if items.len() >= 2 && items[0].is_number() && items[1].is_number() {
                if let (Some(x), Some(y)) = (items[0].as_f64(), items[1].as_f64()) {
                    out.push((x, y));
                }
            } else {
                for item in items {
                    walk_positions(item, out);
                }
            }
        }
        Value::Object(map) => {
            if let Some(coords) = map.get("coordinates") {
                walk_positions(coords, out);
            }
            if let Some(geoms) = map.get("geometries") {
                walk_positions(geoms, out);
            }
        }
        _ => {}
    }
}

/// Computes the `[west, south, east, north]` bounding box of a geometry.
pub fn bbox_of(geometry: &Value) -> Result<[f64; 4], EngineError> {
    let mut positions = Vec::new();
    walk_positions(geometry, &mut positions);
    if positions.is_empty() {
        return Err(EngineError::InvalidGeometry(
            "geometry has no coordinates".to_string(),
        ));
    }
    let mut bbox = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    for (x, y) in positions {
        bbox[0] = bbox[0].min(x);
        bbox[1] = bbox[1].min(y);
        bbox[2] = bbox[2].max(x);
        bbox[3] = bbox[3].max(y);
    }
    Ok(bbox)
}

fn ring_coords(ring: &Value) -> Result<Vec<(f64, f64)>, EngineError> {
    ring.as_array()
        .map(|points| {
            points
                .iter()
                .filter_map(|p| {
                    let p = p.as_array()?;
                    Some((p.first()?.as_f64()?, p.get(1)?.as_f64()?))
                })
                .collect()
        })
        .ok_or_else(|| EngineError::InvalidGeometry("ring is not an array".to_string()))
}

/// Signed shoelace area of one ring.
fn ring_area(ring: &[(f64, f64)]) -> f64 {
    let mut area = 0.0;
    for window in ring.windows(2) {
        let (x1, y1) = window[0];
        let (x2, y2) = window[1];
        area += x1 * y2 - x2 * y1;
    }
    area / 2.0
}

fn ring_centroid(ring: &[(f64, f64)]) -> (f64, f64, f64) {
    let area = ring_area(ring);
    if area.abs() < f64::EPSILON {
        // Degenerate ring, fall back to the vertex mean.
        let n = ring.len().max(1) as f64;
        let (sx, sy) = ring
            .iter()
            .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
        return (sx / n, sy / n, 0.0);
    }
    let mut cx = 0.0;
    let mut cy = 0.0;
    for window in ring.windows(2) {
        let (x1, y1) = window[0];
        let (x2, y2) = window[1];
        let cross = x1 * y2 - x2 * y1;
        cx += (x1 + x2) * cross;
        cy += (y1 + y2) * cross;
    }
    (cx / (6.0 * area), cy / (6.0 * area), area.abs())
}

/// Area-weighted centroid of a polygon or multipolygon, as a GeoJSON
/// point. Points and linestrings fall back to the vertex mean.
pub fn centroid(geometry: &Value) -> Result<Value, EngineError> {
    let geom_type = geometry
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let coordinates = geometry
        .get("coordinates")
        .ok_or_else(|| EngineError::InvalidGeometry("geometry has no coordinates".to_string()))?;

    let exteriors: Vec<Vec<(f64, f64)>> = match geom_type {
        "Polygon" => vec![ring_coords(
            coordinates
                .get(0)
                .ok_or_else(|| EngineError::InvalidGeometry("empty polygon".to_string()))?,
        )?],
        "MultiPolygon" => coordinates
            .as_array()
            .map(|polys| {
                polys
                    .iter()
                    .filter_map(|poly| poly.get(0))
                    .map(ring_coords)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default(),
        _ => {
            let mut positions = Vec::new();
            walk_positions(geometry, &mut positions);
            if positions.is_empty() {
                return Err(EngineError::InvalidGeometry(
                    "geometry has no coordinates".to_string(),
                ));
            }
            let n = positions.len() as f64;
            let (sx, sy) = positions
                .iter()
                .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
            return Ok(json!({"type": "Point", "coordinates": [sx / n, sy / n]}));
        }
    };

    let mut total_area = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for ring in &exteriors {
        let (x, y, area) = ring_centroid(ring);
        if area > 0.0 {
            cx += x * area;
            cy += y * area;
            total_area += area;
        } else {
            cx += x;
            cy += y;
            total_area += 1.0;
        }
    }
    Ok(json!({
        "type": "Point",
        "coordinates": [cx / total_area, cy / total_area],
    }))
}

/// Perpendicular distance from `p` to the segment `a`-`b`.
fn point_segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (px, py) = p;
    let (ax, ay) = a;
    let (bx, by) = b;
    let dx = bx - ax;
    let dy = by - ay;
    let len2 = dx * dx + dy * dy;
    if len2 < f64::EPSILON {
        return ((px - ax).powi(2) + (py - ay).powi(2)).sqrt();
    }
    let t = (((px - ax) * dx + (py - ay) * dy) / len2).clamp(0.0, 1.0);
    let (qx, qy) = (ax + t * dx, ay + t * dy);
    ((px - qx).powi(2) + (py - qy).powi(2)).sqrt()
}

fn douglas_peucker(points: &[(f64, f64)], tolerance: f64) -> Vec<(f64, f64)> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let first = points[0];
    let last = points[points.len() - 1];
    let (mut max_dist, mut index) = (0.0, 0);
    for (i, &p) in points.iter().enumerate().skip(1).take(points.len() - 2) {
        let dist = point_segment_distance(p, first, last);
        if dist > max_dist {
            max_dist = dist;
            index = i;
        }
    }
    if max_dist > tolerance {
        let mut left = douglas_peucker(&points[..=index], tolerance);
        let right = douglas_peucker(&points[index..], tolerance);
        left.pop();
        left.extend(right);
        left
    } else {
        vec![first, last]
    }
}

fn simplify_ring(ring: &Value, tolerance: f64, preserve_topology: bool) -> Result<Value, EngineError> {
    let points = ring_coords(ring)?;
    let mut simplified = douglas_peucker(&points, tolerance);
    // A valid ring needs at least 4 positions including the closing one.
    if preserve_topology && simplified.len() < 4 && points.len() >= 4 {
        simplified = points;
    }
    Ok(Value::Array(
        simplified
            .into_iter()
            .map(|(x, y)| json!([x, y]))
            .collect(),
    ))
}

/// Simplifies a geometry with the Douglas-Peucker algorithm.
pub fn simplify(
    geometry: &Value,
    tolerance: f64,
    preserve_topology: bool,
) -> Result<Value, EngineError> {
    let geom_type = geometry
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let coordinates = geometry
        .get("coordinates")
        .ok_or_else(|| EngineError::InvalidGeometry("geometry has no coordinates".to_string()))?;
    let simplified = match geom_type {
        "LineString" => simplify_ring(coordinates, tolerance, false)?,
        "Polygon" => Value::Array(
            coordinates
                .as_array()
                .into_iter()
                .flatten()
                .map(|ring| simplify_ring(ring, tolerance, preserve_topology))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        "MultiPolygon" => Value::Array(
            coordinates
                .as_array()
                .into_iter()
                .flatten()
                .map(|poly| {
                    Ok(Value::Array(
                        poly.as_array()
                            .into_iter()
                            .flatten()
                            .map(|ring| simplify_ring(ring, tolerance, preserve_topology))
                            .collect::<Result<Vec<_>, EngineError>>()?,
                    ))
                })
                .collect::<Result<Vec<_>, EngineError>>()?,
        ),
        other => {
            return Err(EngineError::InvalidGeometry(format!(
                "cannot simplify geometry of type '{other}'"
            )))
        }
    };
    Ok(json!({"type": geom_type, "coordinates": simplified}))
}

fn map_positions<F>(value: &Value, f: &F) -> Value
where
    F: Fn(f64, f64) -> (f64, f64),
{
    match value {
        Value::Array(items) => {
            if items.len() >= 2 && items[0].is_number() && items[1].is_number() {
                if let (Some(x), Some(y)) = (items[0].as_f64(), items[1].as_f64()) {
                    let (nx, ny) = f(x, y);
                    return json!([nx, ny]);
                }
                value.clone()
            } else {
                Value::Array(items.iter().map(|item| map_positions(item, f)).collect())
            }
        }
        other => other.clone(),
    }
}

/// Reprojects every position in a geometry; `precision` rounds the
/// output coordinates when non-negative.
pub fn transform_geom(
    geometry: &Value,
    src: Crs,
    dst: Crs,
    precision: i64,
) -> Result<Value, EngineError> {
    let geom_type = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::InvalidGeometry("geometry has no type".to_string()))?;
    let coordinates = geometry
        .get("coordinates")
        .ok_or_else(|| EngineError::InvalidGeometry("geometry has no coordinates".to_string()))?;
    let mapped = map_positions(coordinates, &|x, y| {
        let (nx, ny) = transform_point(src, dst, x, y);
        (round_to(nx, precision), round_to(ny, precision))
    });
    Ok(json!({"type": geom_type, "coordinates": mapped}))
}

/// Inserts `factor` interpolated points along each ring segment. Used to
/// keep reprojected footprints from cutting corners.
pub fn densify_ring(ring: &[(f64, f64)], factor: usize) -> Vec<(f64, f64)> {
    if factor < 2 || ring.len() < 2 {
        return ring.to_vec();
    }
    let mut out = Vec::with_capacity(ring.len() * factor);
    for window in ring.windows(2) {
        let (x1, y1) = window[0];
        let (x2, y2) = window[1];
        for step in 0..factor {
            let t = step as f64 / factor as f64;
            out.push((x1 + (x2 - x1) * t, y1 + (y2 - y1) * t));
        }
    }
    out.push(*ring.last().expect("ring checked non-empty"));
    out
}
