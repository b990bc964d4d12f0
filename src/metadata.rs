use std::fmt;
use std::path::Path;
use std::sync::Arc;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::model::{CtlType, FieldMetadata, RecordMetadata};

// ── Error type ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Xml(quick_xml::Error),
    Invalid(String),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::Io(e) => write!(f, "I/O error: {e}"),
            MetadataError::Xml(e) => write!(f, "XML error: {e}"),
            MetadataError::Invalid(msg) => write!(f, "Invalid metadata: {msg}"),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Io(e)
    }
}

impl From<quick_xml::Error> for MetadataError {
    fn from(e: quick_xml::Error) -> Self {
        MetadataError::Xml(e)
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Read every `<Record>` in a metadata file.
pub fn load_metadata(path: &Path) -> Result<Vec<Arc<RecordMetadata>>, MetadataError> {
    let xml = std::fs::read_to_string(path)?;
    parse_metadata_xml(&xml)
}

/// Parse `<Record name=".."><Field name=".." type=".." .../></Record>`
/// elements, either at the root or under any wrapper element.
///
/// Field attributes: `type` (required), `nullable` (default `true`),
/// `length` and `scale` for decimals, `containerType="list|map"` to wrap the
/// field type. Map keys are strings.
pub fn parse_metadata_xml(xml: &str) -> Result<Vec<Arc<RecordMetadata>>, MetadataError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut current: Option<(String, Vec<FieldMetadata>)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) if e.name().as_ref() == b"Record" => {
                current = Some((record_name(e)?, Vec::new()));
            }
            Event::Empty(ref e) if e.name().as_ref() == b"Record" => {
                records.push(Arc::new(RecordMetadata::new(record_name(e)?, Vec::new())));
            }
            Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == b"Field" => {
                let Some((record, fields)) = current.as_mut() else {
                    return Err(MetadataError::Invalid("<Field> outside of <Record>".to_string()));
                };
                fields.push(parse_field(record, e)?);
            }
            Event::End(ref e) if e.name().as_ref() == b"Record" => {
                if let Some((name, fields)) = current.take() {
                    log::debug!("loaded metadata '{name}' with {} field(s)", fields.len());
                    records.push(Arc::new(RecordMetadata::new(name, fields)));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if records.is_empty() {
        return Err(MetadataError::Invalid("no <Record> element found".to_string()));
    }
    Ok(records)
}

fn attributes(e: &BytesStart<'_>) -> Vec<(String, String)> {
    e.attributes()
        .flatten()
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let val = String::from_utf8_lossy(&attr.value).to_string();
            (key, val)
        })
        .collect()
}

fn attribute(attrs: &[(String, String)], name: &str) -> Option<String> {
    attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
}

fn record_name(e: &BytesStart<'_>) -> Result<String, MetadataError> {
    attribute(&attributes(e), "name")
        .ok_or_else(|| MetadataError::Invalid("<Record> without a name".to_string()))
}

fn parse_field(record: &str, e: &BytesStart<'_>) -> Result<FieldMetadata, MetadataError> {
    let attrs = attributes(e);
    let invalid = MetadataError::Invalid;
    let name = attribute(&attrs, "name")
        .ok_or_else(|| invalid(format!("field without a name in record '{record}'")))?;
    let type_name = attribute(&attrs, "type")
        .ok_or_else(|| invalid(format!("field '{name}' of record '{record}' has no type")))?;
    let scalar = scalar_type(&type_name).ok_or_else(|| {
        invalid(format!("field '{name}' of record '{record}' has unknown type '{type_name}'"))
    })?;
    let ty = match attribute(&attrs, "containerType").as_deref() {
        None | Some("" | "single") => scalar,
        Some("list") => CtlType::list_of(scalar),
        Some("map") => CtlType::map_of(CtlType::String, scalar),
        Some(other) => {
            return Err(MetadataError::Invalid(format!(
                "field '{name}' of record '{record}' has unknown container type '{other}'"
            )))
        }
    };

    let mut field = FieldMetadata::new(name.as_str(), ty);
    if attribute(&attrs, "nullable").is_some_and(|v| v.eq_ignore_ascii_case("false")) {
        field = field.not_null();
    }
    let number = |key: &str| -> Result<Option<u32>, MetadataError> {
        attribute(&attrs, key)
            .map(|v| {
                v.trim()
                    .parse::<u32>()
                    .map_err(|_| MetadataError::Invalid(format!("field '{name}': bad {key} '{v}'")))
            })
            .transpose()
    };
    if let (Some(length), scale) = (number("length")?, number("scale")?) {
        field = field.with_precision(length, scale.unwrap_or(0));
    }
    if let Some(label) = attribute(&attrs, "label") {
        field = field.with_label(label);
    }
    Ok(field)
}

/// Scalar type named by a metadata `type` attribute.
fn scalar_type(name: &str) -> Option<CtlType> {
    Some(match name.to_ascii_lowercase().as_str() {
        "string" => CtlType::String,
        "integer" | "int" => CtlType::Integer,
        "long" => CtlType::Long,
        "number" | "double" | "numeric" => CtlType::Number,
        "decimal" => CtlType::Decimal,
        "boolean" | "bool" => CtlType::Boolean,
        "date" => CtlType::Date,
        _ => return None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const PERSON: &str = r#"
        <Metadata>
          <Record name="person">
            <Field name="name" type="string" nullable="false"/>
            <Field name="age" type="integer"/>
            <Field name="salary" type="decimal" length="10" scale="2"/>
            <Field name="tags" type="string" containerType="list"/>
            <Field name="scores" type="number" containerType="map"/>
          </Record>
          <Record name="empty"/>
        </Metadata>
    "#;

    #[test]
    fn parses_fields_and_attributes() {
        let records = parse_metadata_xml(PERSON).unwrap();
        assert_eq!(records.len(), 2);
        let person = &records[0];
        assert_eq!(person.name(), "person");
        assert_eq!(person.field_count(), 5);
        assert!(!person.fields()[0].nullable);
        assert!(person.fields()[1].nullable);
        assert_eq!(person.fields()[2].length, Some(10));
        assert_eq!(person.fields()[2].scale, Some(2));
        assert_eq!(person.fields()[3].ty, CtlType::list_of(CtlType::String));
        assert_eq!(person.fields()[4].ty, CtlType::map_of(CtlType::String, CtlType::Number));
        assert_eq!(records[1].field_count(), 0);
    }

    #[test]
    fn single_record_at_the_root() {
        let xml = r#"<Record name="r"><Field name="id" type="long"/></Record>"#;
        let records = parse_metadata_xml(xml).unwrap();
        assert_eq!(records[0].fields()[0].ty, CtlType::Long);
    }

    #[test]
    fn unknown_types_are_rejected() {
        let xml = r#"<Record name="r"><Field name="x" type="blob"/></Record>"#;
        let err = parse_metadata_xml(xml).unwrap_err();
        assert!(err.to_string().contains("unknown type 'blob'"));
    }

    #[test]
    fn fields_need_a_record() {
        assert!(parse_metadata_xml(r#"<Field name="x" type="string"/>"#).is_err());
        assert!(parse_metadata_xml("<Nothing/>").is_err());
    }
}
