//! Coordinate reference systems and point transforms.
//!
//! Covers the systems rasters in the supported catalogs actually use:
//! geographic WGS84 (EPSG:4326), spherical web mercator (EPSG:3857) and
//! the WGS84 UTM grid (EPSG:326xx north, 327xx south). Transforms go
//! through geographic coordinates as the pivot.

use crate::error::RasterError;

// WGS84 ellipsoid.
const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;

// Web mercator uses the sphere of radius a.
const MERCATOR_R: f64 = WGS84_A;

const UTM_K0: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// A supported coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// EPSG:4326, coordinates in lon/lat degrees.
    Geographic,
    /// EPSG:3857, spherical web mercator meters.
    WebMercator,
    /// WGS84 UTM zone, EPSG:326xx north / 327xx south.
    Utm { zone: u8, north: bool },
}

impl Crs {
    /// Resolves an EPSG code.
    ///
    /// # Errors
    ///
    /// `RasterError::UnsupportedCrs` for codes outside the supported set.
    pub fn from_epsg(code: u32) -> Result<Self, RasterError> {
        match code {
            4326 => Ok(Crs::Geographic),
            3857 => Ok(Crs::WebMercator),
            32601..=32660 => Ok(Crs::Utm {
                zone: (code - 32600) as u8,
                north: true,
            }),
            32701..=32760 => Ok(Crs::Utm {
                zone: (code - 32700) as u8,
                north: false,
            }),
            other => Err(RasterError::UnsupportedCrs(format!("EPSG:{other}"))),
        }
    }

    /// Parses an authority string such as `EPSG:4326`, or a bare code.
    pub fn parse(s: &str) -> Result<Self, RasterError> {
        let code = s
            .strip_prefix("EPSG:")
            .or_else(|| s.strip_prefix("epsg:"))
            .unwrap_or(s);
        let code: u32 = code
            .trim()
            .parse()
            .map_err(|_| RasterError::UnsupportedCrs(s.to_string()))?;
        Self::from_epsg(code)
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Geographic => 4326,
            Crs::WebMercator => 3857,
            Crs::Utm { zone, north: true } => 32600 + u32::from(*zone),
            Crs::Utm { zone, north: false } => 32700 + u32::from(*zone),
        }
    }

    /// Projects a coordinate in this system to lon/lat degrees.
    pub fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Crs::Geographic => (x, y),
            Crs::WebMercator => {
                let lon = (x / MERCATOR_R).to_degrees();
                let lat = (2.0 * (y / MERCATOR_R).exp().atan() - std::f64::consts::FRAC_PI_2)
                    .to_degrees();
                (lon, lat)
            }
            Crs::Utm { zone, north } => utm_to_geographic(*zone, *north, x, y),
        }
    }

    /// Projects lon/lat degrees into this system.
    pub fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            Crs::Geographic => (lon, lat),
            Crs::WebMercator => {
                let x = MERCATOR_R * lon.to_radians();
                let y = MERCATOR_R
                    * ((std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan()).ln();
                (x, y)
            }
            Crs::Utm { zone, north } => geographic_to_utm(*zone, *north, lon, lat),
        }
    }

    /// WKT2 description of the system.
    pub fn wkt2(&self) -> String {
        match self {
            Crs::Geographic => concat!(
                "GEOGCRS[\"WGS 84\",DATUM[\"World Geodetic System 1984\",",
                "ELLIPSOID[\"WGS 84\",6378137,298.257223563,LENGTHUNIT[\"metre\",1]]],",
                "CS[ellipsoidal,2],AXIS[\"geodetic latitude (Lat)\",north],",
                "AXIS[\"geodetic longitude (Lon)\",east],",
                "ANGLEUNIT[\"degree\",0.0174532925199433],ID[\"EPSG\",4326]]"
            )
            .to_string(),
            Crs::WebMercator => concat!(
                "PROJCRS[\"WGS 84 / Pseudo-Mercator\",BASEGEOGCRS[\"WGS 84\",",
                "DATUM[\"World Geodetic System 1984\",ELLIPSOID[\"WGS 84\",",
                "6378137,298.257223563,LENGTHUNIT[\"metre\",1]]]],",
                "CONVERSION[\"Popular Visualisation Pseudo-Mercator\",",
                "METHOD[\"Popular Visualisation Pseudo Mercator\",ID[\"EPSG\",1024]]],",
                "CS[Cartesian,2],AXIS[\"easting (X)\",east],AXIS[\"northing (Y)\",north],",
                "LENGTHUNIT[\"metre\",1],ID[\"EPSG\",3857]]"
            )
            .to_string(),
            Crs::Utm { zone, north } => {
                let hemisphere = if *north { "N" } else { "S" };
                let central_meridian = f64::from(*zone) * 6.0 - 183.0;
                let false_northing = if *north { 0.0 } else { UTM_FALSE_NORTHING_SOUTH };
                format!(
                    concat!(
                        "PROJCRS[\"WGS 84 / UTM zone {zone}{hemisphere}\",",
                        "BASEGEOGCRS[\"WGS 84\",DATUM[\"World Geodetic System 1984\",",
                        "ELLIPSOID[\"WGS 84\",6378137,298.257223563,",
                        "LENGTHUNIT[\"metre\",1]]]],",
                        "CONVERSION[\"UTM zone {zone}{hemisphere}\",",
                        "METHOD[\"Transverse Mercator\",ID[\"EPSG\",9807]],",
                        "PARAMETER[\"Latitude of natural origin\",0],",
                        "PARAMETER[\"Longitude of natural origin\",{central_meridian}],",
                        "PARAMETER[\"Scale factor at natural origin\",0.9996],",
                        "PARAMETER[\"False easting\",500000],",
                        "PARAMETER[\"False northing\",{false_northing}]],",
                        "CS[Cartesian,2],AXIS[\"easting (E)\",east],",
                        "AXIS[\"northing (N)\",north],LENGTHUNIT[\"metre\",1],",
                        "ID[\"EPSG\",{epsg}]]"
                    ),
                    zone = zone,
                    hemisphere = hemisphere,
                    central_meridian = central_meridian,
                    false_northing = false_northing,
                    epsg = self.epsg(),
                )
            }
        }
    }
}

/// Transforms one point between two systems.
pub fn transform_point(src: Crs, dst: Crs, x: f64, y: f64) -> (f64, f64) {
    if src == dst {
        return (x, y);
    }
    let (lon, lat) = src.to_geographic(x, y);
    dst.from_geographic(lon, lat)
}

fn eccentricity_squared() -> f64 {
    WGS84_F * (2.0 - WGS84_F)
}

fn central_meridian(zone: u8) -> f64 {
    (f64::from(zone) * 6.0 - 183.0).to_radians()
}

/// Meridional arc length from the equator.
fn meridional_arc(phi: f64) -> f64 {
    let e2 = eccentricity_squared();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    WGS84_A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

fn geographic_to_utm(zone: u8, north: bool, lon: f64, lat: f64) -> (f64, f64) {
    let e2 = eccentricity_squared();
    let ep2 = e2 / (1.0 - e2);
    let phi = lat.to_radians();
    let lambda = lon.to_radians();
    let lambda0 = central_meridian(zone);

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let tan_phi = phi.tan();

    let n = WGS84_A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = ep2 * cos_phi * cos_phi;
    let a = cos_phi * (lambda - lambda0);
    let m = meridional_arc(phi);

    let easting = UTM_K0
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + UTM_FALSE_EASTING;
    let mut northing = UTM_K0
        * (m + n
            * tan_phi
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
    if !north {
        northing += UTM_FALSE_NORTHING_SOUTH;
    }
    (easting, northing)
}

fn utm_to_geographic(zone: u8, north: bool, easting: f64, northing: f64) -> (f64, f64) {
    let e2 = eccentricity_squared();
    let ep2 = e2 / (1.0 - e2);
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let x = easting - UTM_FALSE_EASTING;
    let y = if north {
        northing
    } else {
        northing - UTM_FALSE_NORTHING_SOUTH
    };

    let m = y / UTM_K0;
    let mu = m
        / (WGS84_A
            * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2 * e2 * e2 / 256.0));

    // Footpoint latitude.
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let tan_phi1 = phi1.tan();

    let c1 = ep2 * cos_phi1 * cos_phi1;
    let t1 = tan_phi1 * tan_phi1;
    let n1 = WGS84_A / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let r1 = WGS84_A * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * UTM_K0);

    let phi = phi1
        - (n1 * tan_phi1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1
                    - 252.0 * ep2
                    - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lambda = central_meridian(zone)
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos_phi1;

    (lambda.to_degrees(), phi.to_degrees())
}
