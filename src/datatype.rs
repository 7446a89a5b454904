// used for the text forms of values and the sortable catalog encodings
use std::fmt;
use std::str::FromStr;
use std::collections::BTreeMap;

// used for timestamps in metadata and in the catalog
use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
// used for decimal numbers
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::error::{FolioError, Result};

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

// leading byte of a decimal catalog key
const DECIMAL_NEGATIVE: u8 = 0x40;
const DECIMAL_ZERO: u8 = 0x80;
const DECIMAL_POSITIVE: u8 = 0xc0;

/// The datatype of a field, which decides how its values are written in
/// metadata files, encoded in the catalog and tokenized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Boolean,
    Integer,
    Decimal,
    String,
    Unicode,
    DateTime,
    Date,
}

impl FieldType {
    /// Parses the text form used in metadata files.
    pub fn decode(&self, text: &str) -> Result<Value> {
        let invalid = |what: &str| {
            FolioError::InvalidValue(format!("'{text}' is not a valid {what}"))
        };
        Ok(match self {
            FieldType::Boolean => match text.trim() {
                "1" | "true" => Value::Bool(true),
                "0" | "false" | "" => Value::Bool(false),
                _ => return Err(invalid("boolean")),
            },
            FieldType::Integer => {
                Value::Int(text.trim().parse::<i64>().map_err(|_| invalid("integer"))?)
            }
            FieldType::Decimal => Value::Decimal(
                BigDecimal::from_str(text.trim()).map_err(|_| invalid("decimal"))?,
            ),
            FieldType::String => Value::Str(text.to_string()),
            FieldType::Unicode => Value::Str(text.to_string()),
            FieldType::DateTime => {
                let text = text.trim();
                if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                    Value::DateTime(dt)
                } else {
                    let naive = NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
                        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
                        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M"))
                        .map_err(|_| invalid("datetime"))?;
                    Value::NaiveDateTime(naive)
                }
            }
            FieldType::Date => Value::Date(
                NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).map_err(|_| invalid("date"))?,
            ),
        })
    }

    pub fn is_text(&self) -> bool {
        matches!(self, FieldType::String | FieldType::Unicode)
    }

    /// Converts a value to this datatype: strings are parsed, integers and
    /// decimals convert into each other when no digit is lost, anything
    /// goes into a text field through its text form. Other mismatches are
    /// refused.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        let mismatch = || {
            FolioError::InvalidValue(format!("'{value}' cannot be used as a {self} value"))
        };
        Ok(match (self, value) {
            (FieldType::String | FieldType::Unicode, Value::Str(_)) => value.clone(),
            (FieldType::String | FieldType::Unicode, other) => Value::Str(other.encode()),
            (_, Value::Str(s)) => self.decode(s)?,
            (FieldType::Boolean, Value::Bool(_))
            | (FieldType::Integer, Value::Int(_))
            | (FieldType::Decimal, Value::Decimal(_))
            | (FieldType::DateTime, Value::DateTime(_) | Value::NaiveDateTime(_))
            | (FieldType::Date, Value::Date(_)) => value.clone(),
            (FieldType::Decimal, Value::Int(i)) => Value::Decimal(BigDecimal::from(*i)),
            (FieldType::Integer, Value::Decimal(d)) if d.is_integer() => {
                Value::Int(d.with_scale(0).to_string().parse::<i64>().map_err(|_| mismatch())?)
            }
            (FieldType::DateTime, Value::Date(d)) => Value::NaiveDateTime(d.and_time(NaiveTime::MIN)),
            _ => return Err(mismatch()),
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::String => "string",
            FieldType::Unicode => "unicode",
            FieldType::DateTime => "datetime",
            FieldType::Date => "date",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Decimal(BigDecimal),
    Str(String),
    DateTime(DateTime<FixedOffset>),
    NaiveDateTime(NaiveDateTime),
    Date(NaiveDate),
}

impl Value {
    /// The text form used in metadata files.
    pub fn encode(&self) -> String {
        match self {
            Value::Bool(true) => "1".to_string(),
            Value::Bool(false) => "0".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Str(s) => s.clone(),
            Value::DateTime(dt) => dt.to_rfc3339(),
            Value::NaiveDateTime(dt) => dt.format(DATETIME_FORMAT).to_string(),
            Value::Date(d) => d.format(DATE_FORMAT).to_string(),
        }
    }

    /// The catalog form of a value. Integers and decimals are encoded so
    /// that the byte order matches the numeric order, decimals without any
    /// loss of precision; datetimes are
    /// converted to UTC first (naive ones being read as local time).
    pub fn to_catalog_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bool(b) => if *b { b"1".to_vec() } else { b"0".to_vec() },
            Value::Int(i) => ((*i as u64) ^ (1 << 63)).to_be_bytes().to_vec(),
            Value::Decimal(d) => decimal_key(d),
            Value::Str(s) => s.as_bytes().to_vec(),
            Value::DateTime(dt) => {
                dt.with_timezone(&Utc).format(DATETIME_FORMAT).to_string().into_bytes()
            }
            Value::NaiveDateTime(naive) => {
                let utc = match Local.from_local_datetime(naive).earliest() {
                    Some(local) => local.with_timezone(&Utc),
                    // a local time skipped by a DST jump
                    None => Utc.from_utc_datetime(naive),
                };
                utc.format(DATETIME_FORMAT).to_string().into_bytes()
            }
            Value::Date(d) => d.format(DATE_FORMAT).to_string().into_bytes(),
        }
    }

    /// Inverse of [`Value::to_catalog_bytes`] for the given datatype.
    /// Datetimes come back in UTC.
    pub fn from_catalog_bytes(datatype: FieldType, data: &[u8]) -> Result<Value> {
        let corrupt = || FolioError::DataCorruption {
            message: format!("cannot decode a stored {datatype} value"),
        };
        Ok(match datatype {
            FieldType::Boolean => Value::Bool(data == b"1"),
            FieldType::Integer => {
                let bytes: [u8; 8] = data.try_into().map_err(|_| corrupt())?;
                Value::Int((u64::from_be_bytes(bytes) ^ (1 << 63)) as i64)
            }
            FieldType::Decimal => Value::Decimal(decimal_from_key(data).ok_or_else(corrupt)?),
            FieldType::String | FieldType::Unicode => {
                Value::Str(String::from_utf8(data.to_vec()).map_err(|_| corrupt())?)
            }
            FieldType::DateTime => {
                let text = std::str::from_utf8(data).map_err(|_| corrupt())?;
                let naive =
                    NaiveDateTime::parse_from_str(text, DATETIME_FORMAT).map_err(|_| corrupt())?;
                Value::DateTime(Utc.from_utc_datetime(&naive).fixed_offset())
            }
            FieldType::Date => {
                let text = std::str::from_utf8(data).map_err(|_| corrupt())?;
                Value::Date(NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|_| corrupt())?)
            }
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Str(s) if s.is_empty())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<BigDecimal> for Value {
    fn from(d: BigDecimal) -> Self {
        Value::Decimal(d)
    }
}
impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}
impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::NaiveDateTime(dt)
    }
}
impl From<DateTime<FixedOffset>> for Value {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Value::DateTime(dt)
    }
}

/// `<sign byte><exponent><digits>` where the value is `0.<digits> * 10^exponent`
/// and the digits carry no trailing zero. Negative numbers invert the
/// exponent and the digits, and end with `0xff` so that a longer mantissa
/// sorts first.
fn decimal_key(d: &BigDecimal) -> Vec<u8> {
    let (mantissa, scale) = d.normalized().as_bigint_and_exponent();
    let text = mantissa.to_string();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, text.as_str()),
    };
    if digits == "0" {
        return vec![DECIMAL_ZERO];
    }
    let exponent = (digits.len() as i64).saturating_sub(scale);
    let biased = (exponent as u64) ^ (1 << 63);
    let mut key = Vec::with_capacity(digits.len() + 10);
    if negative {
        key.push(DECIMAL_NEGATIVE);
        key.extend_from_slice(&(!biased).to_be_bytes());
        key.extend(digits.bytes().map(|b| 0xff - b));
        key.push(0xff);
    } else {
        key.push(DECIMAL_POSITIVE);
        key.extend_from_slice(&biased.to_be_bytes());
        key.extend_from_slice(digits.as_bytes());
    }
    key
}

fn decimal_from_key(data: &[u8]) -> Option<BigDecimal> {
    let (&sign, rest) = data.split_first()?;
    if sign == DECIMAL_ZERO {
        return rest.is_empty().then(|| BigDecimal::from(0));
    }
    if rest.len() < 8 {
        return None;
    }
    let (exponent, digits) = rest.split_at(8);
    let biased = u64::from_be_bytes(exponent.try_into().ok()?);
    let (biased, digits): (u64, Vec<u8>) = match sign {
        DECIMAL_POSITIVE => (biased, digits.to_vec()),
        DECIMAL_NEGATIVE => (!biased, digits.strip_suffix(&[0xff])?.iter().map(|b| 0xff - b).collect()),
        _ => return None,
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let exponent = (biased ^ (1 << 63)) as i64;
    let digits = std::str::from_utf8(&digits).ok()?;
    let minus = if sign == DECIMAL_NEGATIVE { "-" } else { "" };
    BigDecimal::from_str(&format!("{minus}0.{digits}e{exponent}")).ok()
}

/// What a resource hands to the catalog for one field.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogValue {
    Scalar(Value),
    List(Vec<Value>),
    /// language -> value
    Multilingual(BTreeMap<String, Option<Value>>),
}

impl From<Value> for CatalogValue {
    fn from(value: Value) -> Self {
        CatalogValue::Scalar(value)
    }
}

pub type CatalogValues = BTreeMap<String, CatalogValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_sort_bytewise() {
        let values = [-1_000_000_i64, -3, -1, 0, 1, 2, 900, i64::MAX];
        let encoded: Vec<_> = values.iter().map(|i| Value::Int(*i).to_catalog_bytes()).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        let back = Value::from_catalog_bytes(FieldType::Integer, &encoded[1]).unwrap();
        assert_eq!(back, Value::Int(-3));
    }

    #[test]
    fn decimals_sort_bytewise() {
        let values = ["-12.5", "-0.25", "0", "0.001", "3.14", "1e10"];
        let encoded: Vec<_> = values
            .iter()
            .map(|s| Value::Decimal(BigDecimal::from_str(s).unwrap()).to_catalog_bytes())
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        let back = Value::from_catalog_bytes(FieldType::Decimal, &encoded[4]).unwrap();
        assert_eq!(back, Value::Decimal(BigDecimal::from_str("3.14").unwrap()));
    }

    #[test]
    fn decimals_keep_every_digit() {
        let decimal = |s: &str| Value::Decimal(BigDecimal::from_str(s).unwrap());
        for text in ["12345678901234567.89", "-0.000000000000000000001", "0", "-7", "100"] {
            let key = decimal(text).to_catalog_bytes();
            assert_eq!(Value::from_catalog_bytes(FieldType::Decimal, &key).unwrap(), decimal(text), "{text}");
        }
        assert_ne!(decimal("0.1").to_catalog_bytes(), decimal("0.10000000000000000001").to_catalog_bytes());
        assert_eq!(decimal("2.50").to_catalog_bytes(), decimal("2.5").to_catalog_bytes());

        let values = ["-100", "-12.5", "-12", "-0.12", "-0.1", "0", "0.1", "0.10000000000000000001", "0.12", "12", "12.5", "100"];
        let encoded: Vec<_> = values.iter().map(|s| decimal(s).to_catalog_bytes()).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        assert!(Value::from_catalog_bytes(FieldType::Decimal, b"\xc0").is_err());
    }

    #[test]
    fn coercion_to_the_field_type() {
        let decimal = |s: &str| Value::Decimal(BigDecimal::from_str(s).unwrap());
        assert_eq!(FieldType::Decimal.coerce(&Value::Int(5)).unwrap(), decimal("5"));
        assert_eq!(FieldType::Decimal.coerce(&Value::from("2.5")).unwrap(), decimal("2.5"));
        assert_eq!(FieldType::Integer.coerce(&decimal("42.00")).unwrap(), Value::Int(42));
        assert!(FieldType::Integer.coerce(&decimal("4.2")).is_err());
        assert!(FieldType::Integer.coerce(&Value::Bool(true)).is_err());
        assert_eq!(FieldType::String.coerce(&Value::Int(7)).unwrap(), Value::from("7"));
        assert!(matches!(
            FieldType::DateTime.coerce(&FieldType::Date.decode("2020-01-02").unwrap()).unwrap(),
            Value::NaiveDateTime(_)
        ));
    }

    #[test]
    fn datetimes_become_utc() {
        let value = FieldType::DateTime.decode("2020-05-01T10:00:00+02:00").unwrap();
        assert_eq!(value.to_catalog_bytes(), b"2020-05-01T08:00:00".to_vec());
        let naive = FieldType::DateTime.decode("2020-05-01 10:00").unwrap();
        assert!(matches!(naive, Value::NaiveDateTime(_)));
    }

    #[test]
    fn text_forms() {
        assert_eq!(FieldType::Boolean.decode("1").unwrap(), Value::Bool(true));
        assert_eq!(Value::Bool(false).encode(), "0");
        assert_eq!(FieldType::Date.decode("2009-02-28").unwrap().encode(), "2009-02-28");
        assert!(FieldType::Integer.decode("12a").is_err());
    }
}
