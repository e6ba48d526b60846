//! Raster introspection for the template function library.
//!
//! Reads GeoTIFF headers directly over ranged requests instead of
//! shipping a full raster stack: the metadata the STAC projection,
//! raster and EO extensions need all lives in the IFD and GeoKey
//! directory. Anything that is not a classic GeoTIFF is reported as an
//! unsupported driver.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::fetch::BlobFetcher;
use crate::engine::geometry::{bbox_of, bbox_to_geom, densify_ring, transform_geom};
use crate::engine::proj::Crs;
use crate::error::{EngineError, RasterError};

const TIFF_MAGIC: u16 = 42;
const BIGTIFF_MAGIC: u16 = 43;

// Tag ids consumed from the IFD.
const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_SAMPLE_FORMAT: u16 = 339;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_MODEL_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_METADATA: u16 = 42112;
const TAG_GDAL_NODATA: u16 = 42113;

// GeoKey ids.
const KEY_MODEL_TYPE: u16 = 1024;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;

/// Byte access to a raster resource.
pub trait RasterSource {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, EngineError>;
}

/// Ranged HTTP reads through the shared fetcher.
pub struct FetcherSource {
    fetcher: Arc<dyn BlobFetcher>,
    url: String,
}

impl FetcherSource {
    pub fn new(fetcher: Arc<dyn BlobFetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

impl RasterSource for FetcherSource {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, EngineError> {
        self.fetcher.fetch_range(&self.url, offset, length)
    }
}

/// Georeferencing and band metadata of one opened raster. Serializable
/// so it can travel through the template engine as a plain value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterDataset {
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Number of bands.
    pub count: u32,
    /// Per-band data type names (`uint8`, `int16`, `float32`, ...).
    pub data_types: Vec<String>,
    pub nodata: Option<f64>,
    pub scales: Vec<f64>,
    pub offsets: Vec<f64>,
    /// Affine georeferencing coefficients `[a, b, c, d, e, f]` where
    /// `x = a*col + b*row + c` and `y = d*col + e*row + f`.
    pub transform: [f64; 6],
    pub epsg: Option<u32>,
    pub tags: BTreeMap<String, String>,
}

impl RasterDataset {
    /// `[west, south, east, north]` in the dataset's own system.
    pub fn bounds(&self) -> [f64; 4] {
        let [a, b, c, d, e, f] = self.transform;
        let w = f64::from(self.width);
        let h = f64::from(self.height);
        let corners = [
            (c, f),
            (a * w + c, d * w + f),
            (b * h + c, e * h + f),
            (a * w + b * h + c, d * w + e * h + f),
        ];
        let xs = corners.iter().map(|p| p.0);
        let ys = corners.iter().map(|p| p.1);
        [
            xs.clone().fold(f64::MAX, f64::min),
            ys.clone().fold(f64::MAX, f64::min),
            xs.fold(f64::MIN, f64::max),
            ys.fold(f64::MIN, f64::max),
        ]
    }

    pub fn crs(&self) -> Option<Crs> {
        self.epsg.and_then(|code| Crs::from_epsg(code).ok())
    }

    /// Pixel size in CRS units.
    pub fn resolution(&self) -> (f64, f64) {
        (self.transform[0].abs(), self.transform[4].abs())
    }
}

struct TiffBytes {
    data: Vec<u8>,
    little_endian: bool,
}

impl TiffBytes {
    fn slice(&self, offset: usize, len: usize) -> Result<&[u8], RasterError> {
        self.data
            .get(offset..offset + len)
            .ok_or_else(|| RasterError::Invalid(format!("read past end at offset {offset}")))
    }

    fn u16_at(&self, offset: usize) -> Result<u16, RasterError> {
        let b = self.slice(offset, 2)?;
        Ok(if self.little_endian {
            u16::from_le_bytes([b[0], b[1]])
        } else {
            u16::from_be_bytes([b[0], b[1]])
        })
    }

    fn u32_at(&self, offset: usize) -> Result<u32, RasterError> {
        let b = self.slice(offset, 4)?;
        Ok(if self.little_endian {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        })
    }

    fn f64_at(&self, offset: usize) -> Result<f64, RasterError> {
        let b = self.slice(offset, 8)?;
        let arr = [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        Ok(if self.little_endian {
            f64::from_le_bytes(arr)
        } else {
            f64::from_be_bytes(arr)
        })
    }
}

struct IfdEntry {
    tag: u16,
    field_type: u16,
    count: u32,
    /// Raw value/offset field, interpretation depends on size.
    value_offset: u32,
    entry_offset: usize,
}

fn field_size(field_type: u16) -> usize {
    match field_type {
        1 | 2 | 6 | 7 => 1,
        3 | 8 => 2,
        4 | 9 | 11 => 4,
        5 | 10 | 12 => 8,
        _ => 0,
    }
}

impl IfdEntry {
    /// Offset of the value data, honoring the inline-if-it-fits rule.
    fn data_offset(&self) -> usize {
        let total = field_size(self.field_type) * self.count as usize;
        if total <= 4 {
            self.entry_offset + 8
        } else {
            self.value_offset as usize
        }
    }

    fn read_ints(&self, bytes: &TiffBytes) -> Result<Vec<u32>, RasterError> {
        let offset = self.data_offset();
        let size = field_size(self.field_type);
        (0..self.count as usize)
            .map(|i| match size {
                1 => Ok(u32::from(bytes.slice(offset + i, 1)?[0])),
                2 => bytes.u16_at(offset + i * 2).map(u32::from),
                4 => bytes.u32_at(offset + i * 4),
                _ => Err(RasterError::Invalid(format!(
                    "tag {} has non-integer type {}",
                    self.tag, self.field_type
                ))),
            })
            .collect()
    }

    fn read_doubles(&self, bytes: &TiffBytes) -> Result<Vec<f64>, RasterError> {
        if self.field_type != 12 {
            return Err(RasterError::Invalid(format!(
                "tag {} expected DOUBLE, got type {}",
                self.tag, self.field_type
            )));
        }
        let offset = self.data_offset();
        (0..self.count as usize)
            .map(|i| bytes.f64_at(offset + i * 8))
            .collect()
    }

    fn read_ascii(&self, bytes: &TiffBytes) -> Result<String, RasterError> {
        let offset = self.data_offset();
        let raw = bytes.slice(offset, self.count as usize)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).to_string())
    }
}

fn data_type_name(bits: u32, format: u32) -> String {
    match (format, bits) {
        (3, 32) => "float32".to_string(),
        (3, 64) => "float64".to_string(),
        (2, 8) => "int8".to_string(),
        (2, 16) => "int16".to_string(),
        (2, 32) => "int32".to_string(),
        (_, 8) => "uint8".to_string(),
        (_, 16) => "uint16".to_string(),
        (_, 32) => "uint32".to_string(),
        (_, other) => format!("uint{other}"),
    }
}

/// Pulls per-band SCALE/OFFSET items out of the GDAL metadata XML tag.
fn parse_gdal_metadata(xml: &str, bands: usize, name: &str, default: f64) -> Vec<f64> {
    let mut values = vec![default; bands];
    let pattern = regex::Regex::new(
        r#"<Item name="([A-Z_]+)"(?: sample="(\d+)")?[^>]*>([^<]*)</Item>"#,
    )
    .expect("static pattern");
    for captures in pattern.captures_iter(xml) {
        if &captures[1] != name {
            continue;
        }
        let band: usize = captures
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        if let Ok(value) = captures[3].trim().parse::<f64>() {
            if band < bands {
                values[band] = value;
            }
        }
    }
    values
}

fn parse_geokeys(directory: &[u32], bytes: &TiffBytes, entries: &[IfdEntry]) -> Option<u32> {
    if directory.len() < 4 {
        return None;
    }
    let key_count = directory[3] as usize;
    let mut model_type = None;
    let mut geographic = None;
    let mut projected = None;
    for i in 0..key_count {
        let base = 4 + i * 4;
        if base + 3 >= directory.len() {
            break;
        }
        let key_id = directory[base] as u16;
        let location = directory[base + 1] as u16;
        let value = directory[base + 3];
        // Short values are stored inline when location is zero.
        let inline = if location == 0 {
            Some(value)
        } else {
            entries
                .iter()
                .find(|e| e.tag == location)
                .and_then(|e| e.read_ints(bytes).ok())
                .and_then(|vals| vals.get(value as usize).copied())
        };
        match key_id {
            KEY_MODEL_TYPE => model_type = inline,
            KEY_GEOGRAPHIC_TYPE => geographic = inline,
            KEY_PROJECTED_CS_TYPE => projected = inline,
            _ => {}
        }
    }
    match model_type {
        Some(1) => projected.filter(|&c| c != 32767),
        Some(2) => geographic.filter(|&c| c != 32767),
        _ => projected.or(geographic).filter(|&c| c != 32767),
    }
}

/// Opens a raster and reads its metadata.
///
/// # Errors
///
/// `UnsupportedDriver` when the resource is not a classic TIFF,
/// `Invalid` on truncated or malformed headers.
pub fn open_dataset(source: &dyn RasterSource, url: &str) -> Result<RasterDataset, EngineError> {
    // Header plus IFD fit comfortably in the first 64 KiB of any GeoTIFF
    // written by mainstream producers; external tag values are chased
    // with extra ranged reads only if they fall outside.
    let head = source.read(0, 64 * 1024)?;
    if head.len() < 8 {
        return Err(RasterError::Invalid("file shorter than a TIFF header".to_string()).into());
    }
    let little_endian = match (head[0], head[1]) {
        (b'I', b'I') => true,
        (b'M', b'M') => false,
        _ => {
            return Err(
                RasterError::UnsupportedDriver("not a TIFF byte-order mark".to_string()).into(),
            )
        }
    };
    let mut bytes = TiffBytes {
        data: head,
        little_endian,
    };
    let magic = bytes.u16_at(2).map_err(EngineError::from)?;
    if magic == BIGTIFF_MAGIC {
        return Err(RasterError::UnsupportedDriver("BigTIFF".to_string()).into());
    }
    if magic != TIFF_MAGIC {
        return Err(RasterError::UnsupportedDriver(format!("TIFF magic {magic}")).into());
    }
    let ifd_offset = bytes.u32_at(4).map_err(EngineError::from)? as usize;

    // Make sure the whole IFD and its external values are in the buffer.
    ensure_len(&mut bytes, source, ifd_offset + 2)?;
    let entry_count = bytes.u16_at(ifd_offset).map_err(EngineError::from)? as usize;
    ensure_len(&mut bytes, source, ifd_offset + 2 + entry_count * 12 + 4)?;

    let mut entries = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        let entry_offset = ifd_offset + 2 + i * 12;
        let entry = IfdEntry {
            tag: bytes.u16_at(entry_offset).map_err(EngineError::from)?,
            field_type: bytes.u16_at(entry_offset + 2).map_err(EngineError::from)?,
            count: bytes.u32_at(entry_offset + 4).map_err(EngineError::from)?,
            value_offset: bytes.u32_at(entry_offset + 8).map_err(EngineError::from)?,
            entry_offset,
        };
        let total = field_size(entry.field_type) * entry.count as usize;
        if total > 4 {
            ensure_len(&mut bytes, source, entry.value_offset as usize + total)?;
        }
        entries.push(entry);
    }

    let find = |tag: u16| entries.iter().find(|e| e.tag == tag);
    let int_value = |tag: u16| -> Result<Option<u32>, RasterError> {
        find(tag)
            .map(|e| e.read_ints(&bytes).map(|v| v.first().copied().unwrap_or(0)))
            .transpose()
    };

    let width = int_value(TAG_IMAGE_WIDTH)
        .map_err(EngineError::from)?
        .ok_or_else(|| RasterError::Invalid("missing ImageWidth".to_string()))?;
    let height = int_value(TAG_IMAGE_LENGTH)
        .map_err(EngineError::from)?
        .ok_or_else(|| RasterError::Invalid("missing ImageLength".to_string()))?;
    let count = int_value(TAG_SAMPLES_PER_PIXEL)
        .map_err(EngineError::from)?
        .unwrap_or(1)
        .max(1);

    let bits = find(TAG_BITS_PER_SAMPLE)
        .map(|e| e.read_ints(&bytes))
        .transpose()
        .map_err(EngineError::from)?
        .unwrap_or_else(|| vec![8]);
    let formats = find(TAG_SAMPLE_FORMAT)
        .map(|e| e.read_ints(&bytes))
        .transpose()
        .map_err(EngineError::from)?
        .unwrap_or_else(|| vec![1]);
    let data_types = (0..count as usize)
        .map(|band| {
            let b = bits.get(band).or_else(|| bits.first()).copied().unwrap_or(8);
            let f = formats
                .get(band)
                .or_else(|| formats.first())
                .copied()
                .unwrap_or(1);
            data_type_name(b, f)
        })
        .collect();

    let transform = georeference(&entries, &bytes).map_err(EngineError::from)?;

    let geokeys = find(TAG_GEO_KEY_DIRECTORY)
        .map(|e| e.read_ints(&bytes))
        .transpose()
        .map_err(EngineError::from)?;
    let epsg = geokeys.and_then(|dir| parse_geokeys(&dir, &bytes, &entries));

    let nodata = find(TAG_GDAL_NODATA)
        .map(|e| e.read_ascii(&bytes))
        .transpose()
        .map_err(EngineError::from)?
        .and_then(|s| parse_nodata(&s));

    let mut tags = BTreeMap::new();
    let gdal_metadata = find(TAG_GDAL_METADATA)
        .map(|e| e.read_ascii(&bytes))
        .transpose()
        .map_err(EngineError::from)?;
    let (scales, offsets) = match &gdal_metadata {
        Some(xml) => {
            for captures in regex::Regex::new(
                r#"<Item name="([A-Za-z_]+)">([^<]*)</Item>"#,
            )
            .expect("static pattern")
            .captures_iter(xml)
            {
                tags.insert(captures[1].to_string(), captures[2].to_string());
            }
            (
                parse_gdal_metadata(xml, count as usize, "SCALE", 1.0),
                parse_gdal_metadata(xml, count as usize, "OFFSET", 0.0),
            )
        }
        None => (vec![1.0; count as usize], vec![0.0; count as usize]),
    };

    Ok(RasterDataset {
        url: url.to_string(),
        width,
        height,
        count,
        data_types,
        nodata,
        scales,
        offsets,
        transform,
        epsg,
        tags,
    })
}

fn ensure_len(
    bytes: &mut TiffBytes,
    source: &dyn RasterSource,
    needed: usize,
) -> Result<(), EngineError> {
    if bytes.data.len() >= needed {
        return Ok(());
    }
    let offset = bytes.data.len() as u64;
    let length = (needed - bytes.data.len()).max(16 * 1024) as u64;
    let more = source.read(offset, length)?;
    if more.is_empty() {
        return Err(RasterError::Invalid(format!(
            "file truncated, needed {needed} bytes"
        ))
        .into());
    }
    bytes.data.extend_from_slice(&more);
    if bytes.data.len() < needed {
        return Err(RasterError::Invalid(format!(
            "file truncated, needed {needed} bytes"
        ))
        .into());
    }
    Ok(())
}

fn parse_nodata(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => trimmed.parse().ok(),
    }
}

fn georeference(entries: &[IfdEntry], bytes: &TiffBytes) -> Result<[f64; 6], RasterError> {
    if let Some(entry) = entries.iter().find(|e| e.tag == TAG_MODEL_TRANSFORMATION) {
        let m = entry.read_doubles(bytes)?;
        if m.len() >= 8 {
            return Ok([m[0], m[1], m[3], m[4], m[5], m[7]]);
        }
        return Err(RasterError::Invalid(
            "ModelTransformation with fewer than 8 values".to_string(),
        ));
    }
    let scale = entries
        .iter()
        .find(|e| e.tag == TAG_MODEL_PIXEL_SCALE)
        .map(|e| e.read_doubles(bytes))
        .transpose()?;
    let tiepoint = entries
        .iter()
        .find(|e| e.tag == TAG_MODEL_TIEPOINT)
        .map(|e| e.read_doubles(bytes))
        .transpose()?;
    match (scale, tiepoint) {
        (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
            // Tiepoint maps raster (i, j) to model (x, y).
            let origin_x = t[3] - t[0] * s[0];
            let origin_y = t[4] + t[1] * s[1];
            Ok([s[0], 0.0, origin_x, 0.0, -s[1], origin_y])
        }
        // Ungeoreferenced rasters get the identity pixel transform.
        _ => Ok([1.0, 0.0, 0.0, 0.0, -1.0, 0.0]),
    }
}

/// Projection metadata per the STAC projection extension. EPSG, WKT2 and
/// all derived fields appear only when the CRS resolves.
pub fn projection_info(dataset: &RasterDataset) -> Value {
    let bounds = dataset.bounds();
    let mut meta = json!({
        "epsg": dataset.epsg,
        "geometry": bbox_to_geom(&bounds),
        "bbox": bounds.to_vec(),
        "shape": [dataset.height, dataset.width],
        "transform": dataset.transform.to_vec(),
    });
    if let Some(crs) = dataset.crs() {
        meta["wkt2"] = Value::String(crs.wkt2());
    }
    meta
}

/// Footprint and bbox in geographic coordinates.
///
/// The bounds polygon is optionally densified before reprojection so a
/// strongly curved footprint does not collapse to its corner points;
/// `precision` rounds output coordinates when non-negative. A dataset
/// without CRS information falls back to the whole world.
pub fn geometry_info(
    dataset: &RasterDataset,
    densify_pts: usize,
    precision: i64,
) -> Result<Value, EngineError> {
    let Some(crs) = dataset.crs() else {
        let bbox = [-180.0, -90.0, 180.0, 90.0];
        return Ok(json!({
            "bbox": bbox.to_vec(),
            "footprint": bbox_to_geom(&bbox),
        }));
    };

    let bounds = dataset.bounds();
    let mut geom = bbox_to_geom(&bounds);
    if crs != Crs::Geographic && densify_pts > 0 {
        let ring: Vec<(f64, f64)> = geom["coordinates"][0]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|p| Some((p.get(0)?.as_f64()?, p.get(1)?.as_f64()?)))
            .collect();
        let dense: Vec<Value> = densify_ring(&ring, densify_pts)
            .into_iter()
            .map(|(x, y)| json!([x, y]))
            .collect();
        geom = json!({"type": "Polygon", "coordinates": [dense]});
    }
    let footprint = transform_geom(&geom, crs, Crs::Geographic, precision)?;
    let bbox = bbox_of(&footprint)?;
    Ok(json!({
        "bbox": bbox.to_vec(),
        "footprint": footprint,
    }))
}

/// Per-band metadata per the STAC raster extension.
pub fn raster_info(dataset: &RasterDataset) -> Value {
    let (xres, _) = dataset.resolution();
    let sampling = dataset
        .tags
        .get("AREA_OR_POINT")
        .map(|s| s.to_ascii_lowercase());
    let bands: Vec<Value> = (0..dataset.count as usize)
        .map(|band| {
            let mut value = json!({
                "data_type": dataset.data_types.get(band),
                "scale": dataset.scales.get(band).copied().unwrap_or(1.0),
                "offset": dataset.offsets.get(band).copied().unwrap_or(0.0),
                "spatial_resolution": xres,
            });
            if let Some(sampling) = &sampling {
                value["sampling"] = Value::String(sampling.clone());
            }
            if let Some(nodata) = dataset.nodata {
                // JSON numbers cannot carry nan/inf, the extension spells
                // them as strings.
                value["nodata"] = if nodata.is_nan() {
                    Value::String("nan".to_string())
                } else if nodata == f64::INFINITY {
                    Value::String("inf".to_string())
                } else if nodata == f64::NEG_INFINITY {
                    Value::String("-inf".to_string())
                } else {
                    json!(nodata)
                };
            }
            value
        })
        .collect();
    Value::Array(bands)
}

/// Band list per the STAC EO extension.
pub fn eo_bands_info(dataset: &RasterDataset) -> Value {
    let bands: Vec<Value> = (1..=dataset.count)
        .map(|ix| {
            let mut band = json!({"name": format!("b{ix}")});
            if let Some(description) = dataset.tags.get(&format!("BAND_{ix}_DESCRIPTION")) {
                band["description"] = Value::String(description.clone());
            }
            band
        })
        .collect();
    Value::Array(bands)
}

/// Everything in one call: projection, footprint, band and EO metadata.
pub fn raster_file_info(dataset: &RasterDataset) -> Result<Value, EngineError> {
    Ok(json!({
        "projection": projection_info(dataset),
        "geometry": geometry_info(dataset, 0, -1)?,
        "raster_bands": raster_info(dataset),
        "eo_bands": eo_bands_info(dataset),
        "tags": dataset.tags,
    }))
}


#[cfg(test)]
mod tests {
    use super::testutil::{minimal_geotiff, MemorySource};
    use super::*;

    fn dataset() -> RasterDataset {
        let source = MemorySource(minimal_geotiff());
        open_dataset(&source, "https://acct.blob.core.windows.net/data/scene.tif").unwrap()
    }

    #[test]
    fn parses_header_fields() {
        let ds = dataset();
        assert_eq!(ds.width, 512);
        assert_eq!(ds.height, 256);
        assert_eq!(ds.count, 1);
        assert_eq!(ds.data_types, vec!["uint16"]);
        assert_eq!(ds.epsg, Some(32633));
        assert_eq!(ds.nodata, Some(-9999.0));
        assert_eq!(ds.transform, [10.0, 0.0, 500_000.0, 0.0, -10.0, 4_100_000.0]);
    }

    #[test]
    fn bounds_follow_transform() {
        let ds = dataset();
        let bounds = ds.bounds();
        assert_eq!(bounds, [500_000.0, 4_097_440.0, 505_120.0, 4_100_000.0]);
    }

    #[test]
    fn rejects_non_tiff() {
        let source = MemorySource(b"PK\x03\x04 definitely a zip".to_vec());
        let err = open_dataset(&source, "https://x/archive.zip").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Raster(RasterError::UnsupportedDriver(_))
        ));
    }

    #[test]
    fn rejects_bigtiff() {
        let mut data = b"II".to_vec();
        data.extend_from_slice(&43u16.to_le_bytes());
        data.extend_from_slice(&[0u8; 12]);
        let err = open_dataset(&MemorySource(data), "https://x/big.tif").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Raster(RasterError::UnsupportedDriver(ref d)) if d == "BigTIFF"
        ));
    }

    #[test]
    fn projection_info_shape() {
        let ds = dataset();
        let info = projection_info(&ds);
        assert_eq!(info["epsg"], 32633);
        assert_eq!(info["shape"], serde_json::json!([256, 512]));
        assert!(info["wkt2"].as_str().unwrap().contains("UTM zone 33N"));
    }

    #[test]
    fn geometry_info_reprojects_to_geographic() {
        let ds = dataset();
        let info = geometry_info(&ds, 0, 6).unwrap();
        let bbox = info["bbox"].as_array().unwrap();
        // UTM 33N around 500km easting sits near 15 degrees east.
        assert!(bbox[0].as_f64().unwrap() > 14.0 && bbox[0].as_f64().unwrap() < 16.0);
        assert!(bbox[1].as_f64().unwrap() > 36.0 && bbox[1].as_f64().unwrap() < 38.0);
    }

    #[test]
    fn geometry_info_without_crs_is_whole_world() {
        let mut ds = dataset();
        ds.epsg = None;
        let info = geometry_info(&ds, 0, -1).unwrap();
        assert_eq!(
            info["bbox"],
            serde_json::json!([-180.0, -90.0, 180.0, 90.0])
        );
    }

    #[test]
    fn raster_bands_carry_nodata_and_resolution() {
        let ds = dataset();
        let bands = raster_info(&ds);
        assert_eq!(bands[0]["data_type"], "uint16");
        assert_eq!(bands[0]["nodata"], -9999.0);
        assert_eq!(bands[0]["spatial_resolution"], 10.0);
    }

    #[test]
    fn eo_band_names() {
        let ds = dataset();
        let bands = eo_bands_info(&ds);
        assert_eq!(bands[0]["name"], "b1");
    }
}
