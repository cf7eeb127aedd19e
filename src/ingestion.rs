use std::collections::HashMap;
use std::fmt;
use std::io::Read;

use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAddress {
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

/// One venue row as handed over by an upstream parser or scraper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueRecord {
    pub id: String,
    pub venue_name: String,
    pub raw_address_fields: RawAddress,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("record is missing {0}")]
    MissingField(&'static str),
    #[error("record needs a city or zip to locate the address")]
    MissingLocality,
}

/// Canonical cache key derived from a record's address fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedAddress(String);

impl NormalizedAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub fn from_raw(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NormalizedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl VenueRecord {
    pub fn new(
        id: impl Into<String>,
        venue_name: impl Into<String>,
        address: RawAddress,
        date: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            venue_name: venue_name.into(),
            raw_address_fields: address,
            date: date.filter(|value| !value.trim().is_empty()),
        }
    }

    /// Checks the fields the pipeline needs and derives the cache key.
    pub fn validate(&self) -> Result<NormalizedAddress, ValidationError> {
        if self.venue_name.trim().is_empty() {
            return Err(ValidationError::MissingField("venue_name"));
        }
        self.normalized_address()
    }

    pub fn normalized_address(&self) -> Result<NormalizedAddress, ValidationError> {
        let fields = &self.raw_address_fields;
        let street = canonical_part(&fields.address);
        if street.is_empty() {
            return Err(ValidationError::MissingField("address"));
        }
        let city = canonical_part(&fields.city);
        let state = canonical_part(&fields.state);
        let zip = canonical_part(&fields.zip);
        if city.is_empty() && zip.is_empty() {
            return Err(ValidationError::MissingLocality);
        }

        let region = [state, zip]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let key = [street, city, region]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        Ok(NormalizedAddress(key))
    }
}

fn canonical_part(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == ',' || c == ';')
        .trim()
        .to_lowercase()
}

const CSV_COLUMNS: &[(&str, &[&str])] = &[
    ("id", &["id", "record_id"]),
    ("venue_name", &["venue_name", "venue", "name"]),
    ("address", &["address", "street", "street_address"]),
    ("city", &["city"]),
    ("state", &["state", "region"]),
    ("zip", &["zip", "zipcode", "postal_code"]),
    ("date", &["date", "event_date"]),
];

/// Reads `venue_name, address, city, state, zip[, date]` rows. Short or
/// undecodable rows are kept with blank fields so they surface as
/// per-record failures.
pub fn read_csv_records<R: Read>(reader: R) -> AppResult<Vec<VenueRecord>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let mut columns: HashMap<&'static str, usize> = HashMap::new();
    for (index, header) in headers.iter().enumerate() {
        let header = header.trim().to_ascii_lowercase();
        for (field, aliases) in CSV_COLUMNS {
            if aliases.contains(&header.as_str()) && !columns.contains_key(*field) {
                columns.insert(*field, index);
            }
        }
    }
    for required in ["venue_name", "address"] {
        if !columns.contains_key(required) {
            return Err(AppError::Parse(format!(
                "CSV header is missing a {required} column"
            )));
        }
    }

    let mut records = Vec::new();
    for (row_index, row) in csv_reader.records().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(err) if matches!(err.kind(), csv::ErrorKind::Utf8 { .. }) => {
                let id = format!("row-{}", row_index + 1);
                warn!(record_id = %id, %err, "undecodable CSV row kept as a blank record");
                records.push(VenueRecord::new(id, "", RawAddress::default(), None));
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let field = |name: &str| -> String {
            columns
                .get(name)
                .and_then(|index| row.get(*index))
                .unwrap_or_default()
                .to_string()
        };
        let id = Some(field("id"))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("row-{}", row_index + 1));
        records.push(VenueRecord::new(
            id,
            field("venue_name"),
            RawAddress {
                address: field("address"),
                city: field("city"),
                state: field("state"),
                zip: field("zip"),
            },
            Some(field("date")),
        ));
    }
    Ok(records)
}

/// Reads placemarks carrying a postal address (`<address>` or `<description>`).
pub fn parse_kml_records(bytes: &[u8]) -> AppResult<Vec<VenueRecord>> {
    let xml = std::str::from_utf8(bytes)
        .map_err(|err| AppError::Parse(format!("invalid UTF-8 in KML: {err}")))?;
    let document =
        Document::parse(xml).map_err(|err| AppError::Parse(format!("invalid KML: {err}")))?;

    let records = document
        .descendants()
        .filter(|node| node.tag_name().name() == "Placemark")
        .enumerate()
        .map(|(index, placemark)| parse_placemark(index, placemark))
        .collect();
    Ok(records)
}

fn parse_placemark(index: usize, node: Node<'_, '_>) -> VenueRecord {
    let name = child_text(node, "name").unwrap_or_else(|| "Untitled venue".to_string());
    let address_line = child_text(node, "address")
        .or_else(|| child_text(node, "description"))
        .unwrap_or_default();
    let id = node
        .attribute("id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("placemark-{}", index + 1));

    VenueRecord::new(id, name, split_address_line(&address_line), extended_data(node, "date"))
}

fn child_text(node: Node<'_, '_>, tag: &str) -> Option<String> {
    node.children()
        .find(|child| child.tag_name().name() == tag)
        .and_then(|child| child.text())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extended_data(node: Node<'_, '_>, key: &str) -> Option<String> {
    node.descendants()
        .filter(|candidate| matches!(candidate.tag_name().name(), "Data" | "SimpleData"))
        .filter(|candidate| {
            candidate
                .attribute("name")
                .map(|name| name.eq_ignore_ascii_case(key))
                .unwrap_or(false)
        })
        .find_map(|candidate| {
            candidate
                .descendants()
                .find(|child| child.tag_name().name() == "value")
                .and_then(|child| child.text())
                .or_else(|| candidate.text())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
}

/// "1 Main St, Springfield, IL 62701" -> street / city / state / zip.
fn split_address_line(line: &str) -> RawAddress {
    let parts: Vec<&str> = line
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    let mut address = RawAddress::default();
    match parts.as_slice() {
        [] => {}
        [street] => address.address = street.to_string(),
        [street, city] => {
            address.address = street.to_string();
            address.city = city.to_string();
        }
        [street @ .., city, region] => {
            address.address = street.join(", ");
            address.city = city.to_string();
            let mut tokens = region.split_whitespace().collect::<Vec<_>>();
            if tokens.len() > 1
                && tokens
                    .last()
                    .map(|token| token.chars().any(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            {
                address.zip = tokens.pop().unwrap_or_default().to_string();
            }
            address.state = tokens.join(" ");
        }
    }
    address
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
    <kml xmlns="http://www.opengis.net/kml/2.2">
      <Document>
        <Placemark id="arena-x">
          <name>Arena X</name>
          <address>1 Main St, Springfield, IL 62701</address>
          <ExtendedData>
            <Data name="date">
              <value>2024-05-01</value>
            </Data>
          </ExtendedData>
        </Placemark>
        <Placemark>
          <name>Club Y</name>
          <description>22 Elm Ave, Shelbyville</description>
        </Placemark>
      </Document>
    </kml>
    "#;

    fn record(address: &str, city: &str, state: &str, zip: &str) -> VenueRecord {
        VenueRecord::new(
            "r1",
            "Arena X",
            RawAddress {
                address: address.into(),
                city: city.into(),
                state: state.into(),
                zip: zip.into(),
            },
            None,
        )
    }

    #[test]
    fn normalizes_whitespace_and_case() {
        let a = record("1  Main St ", "Springfield", "IL", "62701");
        let b = record("1 main st,", " SPRINGFIELD", "il", " 62701");
        let key = a.normalized_address().unwrap();
        assert_eq!(key.as_str(), "1 main st, springfield, il 62701");
        assert_eq!(key, b.normalized_address().unwrap());
    }

    #[test]
    fn rejects_records_without_street_or_locality() {
        assert_eq!(
            record("", "Springfield", "IL", "").normalized_address(),
            Err(ValidationError::MissingField("address"))
        );
        assert_eq!(
            record("1 Main St", "", "IL", "").normalized_address(),
            Err(ValidationError::MissingLocality)
        );
        assert!(record("1 Main St", "", "", "62701")
            .normalized_address()
            .is_ok());

        let mut unnamed = record("1 Main St", "Springfield", "IL", "62701");
        unnamed.venue_name = "  ".into();
        assert_eq!(
            unnamed.validate(),
            Err(ValidationError::MissingField("venue_name"))
        );
    }

    #[test]
    fn reads_csv_with_aliases_and_short_rows() {
        let input = "\
VENUE,Address,City,State,Zip,Date
Arena X,1 Main St,Springfield,IL,62701,2024-05-01
Club Y,22 Elm Ave
";
        let records = read_csv_records(input.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "row-1");
        assert_eq!(records[0].venue_name, "Arena X");
        assert_eq!(records[0].raw_address_fields.zip, "62701");
        assert_eq!(records[0].date.as_deref(), Some("2024-05-01"));
        assert_eq!(records[1].raw_address_fields.city, "");
        assert!(records[1].date.is_none());
        assert!(records[1].normalized_address().is_err());
    }

    #[test]
    fn undecodable_row_becomes_a_blank_record() {
        let mut input = b"venue_name,address,city,state,zip\n".to_vec();
        input.extend_from_slice(b"Arena X,1 Main St,Springfield,IL,62701\n");
        input.extend_from_slice(b"Caf\xe9 Y,2 Main St,Springfield,IL,62701\n");
        input.extend_from_slice(b"Arena Z,3 Main St,Springfield,IL,62701\n");

        let records = read_csv_records(input.as_slice()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].id, "row-2");
        assert_eq!(records[1].venue_name, "");
        assert_eq!(
            records[1].validate(),
            Err(ValidationError::MissingField("venue_name"))
        );
        assert_eq!(records[2].venue_name, "Arena Z");
        assert!(records[2].validate().is_ok());
    }

    #[test]
    fn rejects_csv_without_address_column() {
        let err = read_csv_records("venue,city\nArena,Springfield\n".as_bytes()).unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn parses_kml_placemarks() {
        let records = parse_kml_records(SAMPLE_KML.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.id, "arena-x");
        assert_eq!(first.raw_address_fields.address, "1 Main St");
        assert_eq!(first.raw_address_fields.city, "Springfield");
        assert_eq!(first.raw_address_fields.state, "IL");
        assert_eq!(first.raw_address_fields.zip, "62701");
        assert_eq!(first.date.as_deref(), Some("2024-05-01"));

        let second = &records[1];
        assert_eq!(second.id, "placemark-2");
        assert_eq!(second.raw_address_fields.city, "Shelbyville");
        assert!(second.normalized_address().is_ok());
    }

    #[test]
    fn rejects_malformed_kml() {
        assert!(matches!(
            parse_kml_records(b"<kml><Placemark>"),
            Err(AppError::Parse(_))
        ));
    }
}
