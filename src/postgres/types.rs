// ABOUTME: Binds entity values to PostgreSQL parameters and reads typed columns back
// ABOUTME: Adapts each value to the parameter type the server inferred for the statement

use std::error::Error;
use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};

use super::numeric::{read_numeric, write_numeric};
use crate::entity::Value;

pub(crate) type BoxError = Box<dyn Error + Sync + Send>;

/// A value converted to the concrete Rust type matching a PostgreSQL type.
#[derive(Debug)]
enum Bound {
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(BigDecimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
}

impl Bound {
    fn write(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Bound::Bool(v) => v.to_sql(ty, out),
            Bound::Int2(v) => v.to_sql(ty, out),
            Bound::Int4(v) => v.to_sql(ty, out),
            Bound::Int8(v) => v.to_sql(ty, out),
            Bound::Float4(v) => v.to_sql(ty, out),
            Bound::Float8(v) => v.to_sql(ty, out),
            Bound::Numeric(v) => {
                write_numeric(v, out)?;
                Ok(IsNull::No)
            }
            Bound::Text(v) => v.to_sql(ty, out),
            Bound::Date(v) => v.to_sql(ty, out),
            Bound::Timestamp(v) => v.to_sql(ty, out),
            Bound::TimestampTz(v) => v.to_sql(ty, out),
            Bound::Uuid(v) => v.to_sql(ty, out),
            Bound::Json(v) => v.to_sql(ty, out),
        }
    }
}

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    format!("cannot bind {:?} to a column of type {}", value, ty).into()
}

fn decimal_to_integer(d: &BigDecimal, ty: &Type) -> Result<Bound, BoxError> {
    if !d.is_integer() {
        return Err(format!("{} has a fractional part and cannot be stored as {}", d, ty).into());
    }
    let out_of_range = || -> BoxError { format!("{} is out of range for {}", d, ty).into() };
    match *ty {
        Type::INT2 => d.to_i16().map(Bound::Int2).ok_or_else(out_of_range),
        Type::INT4 => d.to_i32().map(Bound::Int4).ok_or_else(out_of_range),
        _ => d.to_i64().map(Bound::Int8).ok_or_else(out_of_range),
    }
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, BoxError> {
    const FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    for format in FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(ts);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    Err(format!("invalid timestamp '{}'", s).into())
}

fn parse_timestamptz(s: &str) -> Result<DateTime<Utc>, BoxError> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        // Timestamps without an offset are taken as UTC.
        Err(_) => parse_timestamp(s).map(|ts| ts.and_utc()),
    }
}

impl Value {
    fn bind(&self, ty: &Type) -> Result<Option<Bound>, BoxError> {
        let bound = match self {
            Value::Null => return Ok(None),
            Value::Bool(b) => match *ty {
                Type::BOOL => Bound::Bool(*b),
                _ if is_text(ty) => Bound::Text(b.to_string()),
                Type::JSON | Type::JSONB => Bound::Json(serde_json::Value::Bool(*b)),
                _ => return Err(mismatch(self, ty)),
            },
            Value::Number(d) => match *ty {
                Type::INT2 | Type::INT4 | Type::INT8 => decimal_to_integer(d, ty)?,
                Type::FLOAT4 => Bound::Float4(d.to_f32().ok_or_else(|| mismatch(self, ty))?),
                Type::FLOAT8 => Bound::Float8(d.to_f64().ok_or_else(|| mismatch(self, ty))?),
                Type::NUMERIC => Bound::Numeric(d.clone()),
                Type::JSON | Type::JSONB => {
                    Bound::Json(serde_json::Value::Number(serde_json::Number::from_str(
                        &d.to_plain_string(),
                    )?))
                }
                _ if is_text(ty) => Bound::Text(d.to_plain_string()),
                _ => return Err(mismatch(self, ty)),
            },
            Value::String(s) => match *ty {
                Type::BOOL => Bound::Bool(bool::from_str(s)?),
                Type::INT2 => Bound::Int2(s.parse()?),
                Type::INT4 => Bound::Int4(s.parse()?),
                Type::INT8 => Bound::Int8(s.parse()?),
                Type::FLOAT4 => Bound::Float4(s.parse()?),
                Type::FLOAT8 => Bound::Float8(s.parse()?),
                Type::NUMERIC => Bound::Numeric(BigDecimal::from_str(s)?),
                Type::DATE => Bound::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d")?),
                Type::TIMESTAMP => Bound::Timestamp(parse_timestamp(s)?),
                Type::TIMESTAMPTZ => Bound::TimestampTz(parse_timestamptz(s)?),
                Type::UUID => Bound::Uuid(uuid::Uuid::parse_str(s)?),
                Type::JSON | Type::JSONB => Bound::Json(
                    serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())),
                ),
                _ if is_text(ty) => Bound::Text(s.clone()),
                _ => return Err(mismatch(self, ty)),
            },
            Value::Date(d) => match *ty {
                Type::DATE => Bound::Date(*d),
                Type::TIMESTAMP => Bound::Timestamp(d.and_time(NaiveTime::MIN)),
                Type::TIMESTAMPTZ => Bound::TimestampTz(d.and_time(NaiveTime::MIN).and_utc()),
                _ if is_text(ty) => Bound::Text(d.format("%Y-%m-%d").to_string()),
                _ => return Err(mismatch(self, ty)),
            },
        };
        Ok(Some(bound))
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.bind(ty)? {
            Some(bound) => bound.write(ty, out),
            None => Ok(IsNull::Yes),
        }
    }

    // Conversion happens in to_sql, where the real type is known.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// The current write time, bound to whatever type the sink's timestamp column has.
#[derive(Debug, Clone, Copy)]
pub struct WriteTimestamp(pub DateTime<Utc>);

impl WriteTimestamp {
    pub fn now() -> Self {
        WriteTimestamp(Utc::now())
    }
}

impl ToSql for WriteTimestamp {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match *ty {
            Type::TIMESTAMPTZ => self.0.to_sql(ty, out),
            Type::TIMESTAMP => self.0.naive_utc().to_sql(ty, out),
            Type::DATE => self.0.date_naive().to_sql(ty, out),
            Type::INT8 => self.0.timestamp_millis().to_sql(ty, out),
            _ if is_text(ty) => self
                .0
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .to_sql(ty, out),
            _ => Err(format!("cannot store a write timestamp in a column of type {}", ty).into()),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::TIMESTAMPTZ | Type::TIMESTAMP | Type::DATE | Type::INT8
        ) || is_text(ty)
    }

    to_sql_checked!();
}

fn float_to_decimal<F: std::fmt::Display>(value: F) -> Result<BigDecimal, BoxError> {
    let text = value.to_string();
    BigDecimal::from_str(&text).map_err(|_| format!("{} cannot be represented as a number", text).into())
}

impl<'a> FromSql<'a> for Value {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        let value = match *ty {
            Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
            Type::INT2 => Value::Number(BigDecimal::from(i16::from_sql(ty, raw)?)),
            Type::INT4 => Value::Number(BigDecimal::from(i32::from_sql(ty, raw)?)),
            Type::INT8 => Value::Number(BigDecimal::from(i64::from_sql(ty, raw)?)),
            Type::OID => Value::Number(BigDecimal::from(u32::from_sql(ty, raw)?)),
            // Shortest round-trip rendering, so 0.1 reads back as 0.1.
            Type::FLOAT4 => Value::Number(float_to_decimal(f32::from_sql(ty, raw)?)?),
            Type::FLOAT8 => Value::Number(float_to_decimal(f64::from_sql(ty, raw)?)?),
            Type::NUMERIC => Value::Number(read_numeric(raw)?),
            Type::DATE => Value::Date(NaiveDate::from_sql(ty, raw)?),
            Type::TIMESTAMP => Value::String(
                NaiveDateTime::from_sql(ty, raw)?
                    .format("%Y-%m-%dT%H:%M:%S%.f")
                    .to_string(),
            ),
            Type::TIMESTAMPTZ => Value::String(
                DateTime::<Utc>::from_sql(ty, raw)?.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            Type::UUID => Value::String(uuid::Uuid::from_sql(ty, raw)?.to_string()),
            Type::JSON | Type::JSONB => {
                Value::String(serde_json::Value::from_sql(ty, raw)?.to_string())
            }
            _ => Value::String(String::from_sql(ty, raw)?),
        };
        Ok(value)
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(Value::Null)
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::BOOL
                | Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::OID
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::NUMERIC
                | Type::DATE
                | Type::TIMESTAMP
                | Type::TIMESTAMPTZ
                | Type::UUID
                | Type::JSON
                | Type::JSONB
        ) || is_text(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(value: Value, ty: Type) -> Result<Option<Bound>, BoxError> {
        value.bind(&ty)
    }

    #[test]
    fn test_integer_binding_requires_whole_number() {
        assert!(matches!(
            bind(Value::from(42), Type::INT4).unwrap(),
            Some(Bound::Int4(42))
        ));
        assert!(bind(Value::Number("1.5".parse().unwrap()), Type::INT8).is_err());
        assert!(bind(Value::from(100_000), Type::INT2).is_err());
    }

    #[test]
    fn test_numeric_binding_is_exact() {
        let d: BigDecimal = "0.123456789012345678901234567891".parse().unwrap();
        match bind(Value::Number(d.clone()), Type::NUMERIC).unwrap() {
            Some(Bound::Numeric(bound)) => {
                assert_eq!(bound.to_plain_string(), "0.123456789012345678901234567891")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wide_numeric_round_trips_through_wire_format() {
        let wide: BigDecimal = "123456789012345678901234567890123456.000001".parse().unwrap();
        let mut buf = BytesMut::new();
        assert!(matches!(
            Value::Number(wide).to_sql(&Type::NUMERIC, &mut buf).unwrap(),
            IsNull::No
        ));

        let value = Value::from_sql(&Type::NUMERIC, &buf).unwrap();
        assert_eq!(
            value.to_plain_string().as_deref(),
            Some("123456789012345678901234567890123456.000001")
        );
    }

    #[test]
    fn test_float_columns_read_shortest_form() {
        let raw = 0.1f64.to_be_bytes();
        let value = Value::from_sql(&Type::FLOAT8, &raw).unwrap();
        assert_eq!(value.to_plain_string().as_deref(), Some("0.1"));

        let raw = f64::NAN.to_be_bytes();
        assert!(Value::from_sql(&Type::FLOAT8, &raw).is_err());
    }

    #[test]
    fn test_string_parses_into_typed_columns() {
        assert!(matches!(
            bind(Value::from("2024-01-01"), Type::DATE).unwrap(),
            Some(Bound::Date(_))
        ));
        match bind(Value::from("2024-01-01"), Type::TIMESTAMP).unwrap() {
            Some(Bound::Timestamp(ts)) => {
                assert_eq!(ts.to_string(), "2024-01-01 00:00:00")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            bind(Value::from("17"), Type::INT8).unwrap(),
            Some(Bound::Int8(17))
        ));
        assert!(bind(Value::from("seventeen"), Type::INT8).is_err());
    }

    #[test]
    fn test_timestamptz_accepts_offsets() {
        match bind(Value::from("2024-01-01T12:00:00+02:00"), Type::TIMESTAMPTZ).unwrap() {
            Some(Bound::TimestampTz(ts)) => {
                assert_eq!(ts.to_rfc3339(), "2024-01-01T10:00:00+00:00")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_date_to_text() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        match bind(Value::Date(date), Type::VARCHAR).unwrap() {
            Some(Bound::Text(s)) => assert_eq!(s, "2024-03-09"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_null_binds_as_null() {
        assert!(bind(Value::Null, Type::INT4).unwrap().is_none());
        let mut buf = BytesMut::new();
        assert!(matches!(
            Value::Null.to_sql(&Type::DATE, &mut buf).unwrap(),
            IsNull::Yes
        ));
    }

    #[test]
    fn test_bool_rejected_for_date() {
        assert!(bind(Value::Bool(true), Type::DATE).is_err());
    }

    #[test]
    fn test_write_timestamp_accepts() {
        assert!(<WriteTimestamp as ToSql>::accepts(&Type::TIMESTAMPTZ));
        assert!(<WriteTimestamp as ToSql>::accepts(&Type::DATE));
        assert!(!<WriteTimestamp as ToSql>::accepts(&Type::BOOL));
    }

    #[test]
    fn test_from_sql_accepts_common_types() {
        assert!(<Value as FromSql>::accepts(&Type::NUMERIC));
        assert!(<Value as FromSql>::accepts(&Type::VARCHAR));
        assert!(!<Value as FromSql>::accepts(&Type::BYTEA));
    }

    #[test]
    fn test_from_sql_int4() {
        let raw = 7i32.to_be_bytes();
        let value = Value::from_sql(&Type::INT4, &raw).unwrap();
        assert_eq!(value, Value::from(7));
    }
}
