use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tempfile::NamedTempFile;
use tracing::{info, trace};

use crate::errors::{AppError, AppResult};
use crate::footprint::{FootprintKind, Polygon, Position};
use crate::ingestion::{NormalizedAddress, VenueRecord};
use crate::providers::Coordinate;

pub const GEOJSON_FILE_NAME: &str = "venues.geojson";
pub const KML_FILE_NAME: &str = "venues.kml";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Polygon { coordinates: Vec<Vec<Position>> },
}

impl From<&Polygon> for Geometry {
    fn from(polygon: &Polygon) -> Self {
        Geometry::Polygon {
            coordinates: vec![polygon.ring().to_vec()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
enum FeatureTag {
    Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
enum CollectionTag {
    FeatureCollection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    tag: FeatureTag,
    pub geometry: Geometry,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(geometry: Geometry, properties: Map<String, Value>) -> Self {
        Self {
            tag: FeatureTag::Feature,
            geometry,
            properties,
        }
    }

    /// Venue and parking features of one record share `record_id`. Nothing
    /// time-dependent goes into the properties.
    pub fn footprint(
        record: &VenueRecord,
        address: &NormalizedAddress,
        coordinate: &Coordinate,
        kind: FootprintKind,
        polygon: &Polygon,
    ) -> Self {
        let mut properties = Map::new();
        properties.insert("record_id".into(), json!(record.id));
        properties.insert("venue_name".into(), json!(record.venue_name));
        properties.insert("footprint".into(), json!(kind.as_str()));
        properties.insert("address".into(), json!(address.as_str()));
        if let Some(date) = &record.date {
            properties.insert("date".into(), json!(date));
        }
        properties.insert("provider".into(), json!(coordinate.provider.as_str()));
        properties.insert("center".into(), json!([coordinate.lon, coordinate.lat]));
        trace!(record_id = %record.id, footprint = kind.as_str(), "feature built");
        Self::new(Geometry::from(polygon), properties)
    }

    fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    fn placemark_name(&self) -> String {
        let venue = self.property("venue_name").unwrap_or("Unnamed venue");
        let mut name = match self.property("date") {
            Some(date) => format!("{venue} - {date}"),
            None => venue.to_string(),
        };
        if self.property("footprint") == Some(FootprintKind::Parking.as_str()) {
            name.push_str(" (parking)");
        }
        name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    tag: CollectionTag,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            tag: CollectionTag::FeatureCollection,
            features,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputRef {
    pub geojson: PathBuf,
    pub kml: Option<PathBuf>,
}

/// Writes one job's output directory. `finalize` consumes the writer, so a
/// job's collection is written exactly once.
pub struct FeatureCollectionWriter {
    dir: PathBuf,
    document_name: String,
    emit_kml: bool,
}

impl FeatureCollectionWriter {
    pub fn for_job<P: AsRef<Path>>(output_root: P, job_id: &str, emit_kml: bool) -> Self {
        Self {
            dir: output_root.as_ref().join(job_id),
            document_name: format!("Venue footprints {job_id}"),
            emit_kml,
        }
    }

    pub fn finalize(self, features: Vec<Feature>) -> AppResult<OutputRef> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::Storage(format!("cannot create {}: {err}", self.dir.display()))
        })?;

        let collection = FeatureCollection::new(features);
        let mut geojson = serde_json::to_vec_pretty(&collection)?;
        geojson.push(b'\n');
        let geojson_path = self.dir.join(GEOJSON_FILE_NAME);
        write_atomic(&geojson_path, &geojson)?;

        let kml_path = if self.emit_kml {
            let path = self.dir.join(KML_FILE_NAME);
            write_atomic(&path, render_kml(&self.document_name, &collection.features).as_bytes())?;
            Some(path)
        } else {
            None
        };

        info!(
            path = %geojson_path.display(),
            features = collection.features.len(),
            kml = kml_path.is_some(),
            "feature collection written"
        );
        Ok(OutputRef {
            geojson: geojson_path,
            kml: kml_path,
        })
    }
}

/// Temp file in the target directory, synced, then renamed over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AppError::Path(format!("{} has no parent", path.display())))?;
    let storage_error =
        |err: std::io::Error| AppError::Storage(format!("cannot write {}: {err}", path.display()));

    let mut file = NamedTempFile::new_in(dir).map_err(storage_error)?;
    file.write_all(bytes).map_err(storage_error)?;
    file.as_file().sync_all().map_err(storage_error)?;
    file.persist(path).map_err(|err| storage_error(err.error))?;
    Ok(())
}

fn render_kml(document_name: &str, features: &[Feature]) -> String {
    let mut kml = String::new();
    kml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    kml.push_str("<kml xmlns=\"http://www.opengis.net/kml/2.2\">\n");
    kml.push_str("  <Document>\n");
    let _ = writeln!(kml, "    <name>{}</name>", escape_xml(document_name));
    for feature in features {
        kml.push_str("    <Placemark>\n");
        let _ = writeln!(kml, "      <name>{}</name>", escape_xml(&feature.placemark_name()));
        if let Some(address) = feature.property("address") {
            let _ = writeln!(kml, "      <description>{}</description>", escape_xml(address));
        }
        if !feature.properties.is_empty() {
            kml.push_str("      <ExtendedData>\n");
            for (key, value) in &feature.properties {
                let text = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                let _ = writeln!(
                    kml,
                    "        <Data name=\"{}\"><value>{}</value></Data>",
                    escape_xml(key),
                    escape_xml(&text)
                );
            }
            kml.push_str("      </ExtendedData>\n");
        }
        match &feature.geometry {
            Geometry::Polygon { coordinates } => {
                kml.push_str("      <Polygon>\n");
                for (index, ring) in coordinates.iter().enumerate() {
                    let boundary = if index == 0 {
                        "outerBoundaryIs"
                    } else {
                        "innerBoundaryIs"
                    };
                    let positions = ring.iter().map(kml_position).collect::<Vec<_>>().join(" ");
                    let _ = writeln!(
                        kml,
                        "        <{boundary}><LinearRing><coordinates>{positions}</coordinates></LinearRing></{boundary}>"
                    );
                }
                kml.push_str("      </Polygon>\n");
            }
        }
        kml.push_str("    </Placemark>\n");
    }
    kml.push_str("  </Document>\n");
    kml.push_str("</kml>\n");
    kml
}

fn kml_position(position: &Position) -> String {
    format!("{},{},0", position[0], position[1])
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
