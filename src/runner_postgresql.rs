use crate::{
    config::ExecutorConfig,
    connection::{Connector, StatementConnection},
    executor::{Executor, MAX_TIMEOUT_MS},
    result::{DriverError, ExecuteError, Result},
    statement::Row,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use std::fmt::Write;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::{
    Client, Config, NoTls,
    error::SqlState,
    types::{FromSql, Kind, Type},
};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

// PostgreSQL type OIDs for the column types mapped to JSON
const POSTGRES_TYPE_OID_BOOL: u32 = 16;
const POSTGRES_TYPE_OID_BYTEA: u32 = 17;
const POSTGRES_TYPE_OID_NAME: u32 = 19;
const POSTGRES_TYPE_OID_INT8: u32 = 20;
const POSTGRES_TYPE_OID_INT2: u32 = 21;
const POSTGRES_TYPE_OID_INT4: u32 = 23;
const POSTGRES_TYPE_OID_TEXT: u32 = 25;
const POSTGRES_TYPE_OID_OID: u32 = 26;
const POSTGRES_TYPE_OID_JSON: u32 = 114;
const POSTGRES_TYPE_OID_FLOAT4: u32 = 700;
const POSTGRES_TYPE_OID_FLOAT8: u32 = 701;
const POSTGRES_TYPE_OID_BPCHAR: u32 = 1042;
const POSTGRES_TYPE_OID_VARCHAR: u32 = 1043;
const POSTGRES_TYPE_OID_DATE: u32 = 1082;
const POSTGRES_TYPE_OID_TIME: u32 = 1083;
const POSTGRES_TYPE_OID_TIMESTAMP: u32 = 1114;
const POSTGRES_TYPE_OID_TIMESTAMPTZ: u32 = 1184;
const POSTGRES_TYPE_OID_INTERVAL: u32 = 1186;
const POSTGRES_TYPE_OID_NUMERIC: u32 = 1700;
const POSTGRES_TYPE_OID_VOID: u32 = 2278;
const POSTGRES_TYPE_OID_UUID: u32 = 2950;
const POSTGRES_TYPE_OID_JSONB: u32 = 3802;

// NUMERIC sign words
const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

const MICROS_PER_SECOND: u64 = 1_000_000;
const MICROS_PER_MINUTE: u64 = 60 * MICROS_PER_SECOND;
const MICROS_PER_HOUR: u64 = 60 * MICROS_PER_MINUTE;

/// Opens tokio-postgres connections without TLS
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: Config,
}

impl PostgresConnector {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Connection = PostgresConnection;

    async fn connect(&self) -> std::result::Result<PostgresConnection, DriverError> {
        let (client, connection) = self.config.connect(NoTls).await?;

        // Run the connection in the background until the client is dropped
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(PostgresConnection { client, driver })
    }
}

/// A single PostgreSQL session and the task driving its socket
pub struct PostgresConnection {
    client: Client,
    driver: JoinHandle<()>,
}

#[async_trait]
impl StatementConnection for PostgresConnection {
    async fn set_statement_timeout(
        &mut self,
        timeout: Duration,
    ) -> std::result::Result<(), DriverError> {
        self.client.batch_execute(&statement_timeout_sql(timeout)).await?;
        Ok(())
    }

    async fn fetch_all(&mut self, sql: &str) -> std::result::Result<Vec<Row>, ExecuteError> {
        let rows = self.client.query(sql, &[]).await.map_err(classify_error)?;
        map_rows_to_json_data(&rows)
            .map_err(|err| ExecuteError::Failed(DriverError::Postgres(err)))
    }

    async fn close(self) -> std::result::Result<(), DriverError> {
        let PostgresConnection { client, driver } = self;
        drop(client);
        driver.await?;
        Ok(())
    }
}

/// `statement_timeout` is an int4 of milliseconds; longer timeouts are clamped to its maximum
fn statement_timeout_sql(timeout: Duration) -> String {
    let millis = timeout.as_millis().min(u128::from(MAX_TIMEOUT_MS));
    format!("SET statement_timeout TO {millis}")
}

/// `query_canceled` is what the server reports when `statement_timeout` fires
fn classify_error(err: tokio_postgres::Error) -> ExecuteError {
    if err.code() == Some(&SqlState::QUERY_CANCELED) {
        ExecuteError::TimedOut(DriverError::Postgres(err))
    } else {
        ExecuteError::Failed(DriverError::Postgres(err))
    }
}

fn to_json<T: Into<serde_json::Value>>(value: Option<T>) -> serde_json::Value {
    value.map_or(serde_json::Value::Null, Into::into)
}

/// Convert a PostgreSQL column value based on its type.
/// OID-based detection keeps the mapping stable across type aliases.
pub fn postgres_column_to_json(
    row: &tokio_postgres::Row,
    idx: usize,
) -> std::result::Result<serde_json::Value, tokio_postgres::Error> {
    let column_type = row.columns()[idx].type_();
    let value = match column_type.oid() {
        POSTGRES_TYPE_OID_BOOL => to_json(row.try_get::<_, Option<bool>>(idx)?),
        POSTGRES_TYPE_OID_INT2 => to_json(row.try_get::<_, Option<i16>>(idx)?),
        POSTGRES_TYPE_OID_INT4 => to_json(row.try_get::<_, Option<i32>>(idx)?),
        POSTGRES_TYPE_OID_INT8 => to_json(row.try_get::<_, Option<i64>>(idx)?),
        POSTGRES_TYPE_OID_OID => to_json(row.try_get::<_, Option<u32>>(idx)?),
        POSTGRES_TYPE_OID_FLOAT4 => {
            let val: Option<f32> = row.try_get(idx)?;
            float_to_json(val.map(f64::from))
        }
        POSTGRES_TYPE_OID_FLOAT8 => float_to_json(row.try_get(idx)?),
        POSTGRES_TYPE_OID_TEXT
        | POSTGRES_TYPE_OID_VARCHAR
        | POSTGRES_TYPE_OID_BPCHAR
        | POSTGRES_TYPE_OID_NAME => to_json(row.try_get::<_, Option<String>>(idx)?),
        POSTGRES_TYPE_OID_BYTEA => to_json(row.try_get::<_, Option<Vec<u8>>>(idx)?),
        POSTGRES_TYPE_OID_JSON | POSTGRES_TYPE_OID_JSONB => {
            to_json(row.try_get::<_, Option<serde_json::Value>>(idx)?)
        }
        POSTGRES_TYPE_OID_DATE => {
            to_json(row.try_get::<_, Option<NaiveDate>>(idx)?.map(|d| d.to_string()))
        }
        POSTGRES_TYPE_OID_TIME => {
            to_json(row.try_get::<_, Option<NaiveTime>>(idx)?.map(|t| t.to_string()))
        }
        POSTGRES_TYPE_OID_TIMESTAMP => to_json(
            row.try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|ts| ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        ),
        POSTGRES_TYPE_OID_TIMESTAMPTZ => to_json(
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        ),
        // Numeric, interval, uuid, void, enums and domains are decoded from the wire format here
        _ => row
            .try_get::<_, Option<WireValue>>(idx)?
            .map_or(serde_json::Value::Null, |value| value.0),
    };
    Ok(value)
}

/// A column value decoded directly from PostgreSQL's binary format
struct WireValue(serde_json::Value);

impl<'a> FromSql<'a> for WireValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        let value = match ty.oid() {
            POSTGRES_TYPE_OID_NUMERIC => numeric_to_json(decode_numeric(raw)?),
            POSTGRES_TYPE_OID_INTERVAL => serde_json::Value::String(decode_interval(raw)?),
            POSTGRES_TYPE_OID_UUID => serde_json::Value::String(decode_uuid(raw)?),
            POSTGRES_TYPE_OID_VOID => serde_json::Value::Null,
            _ => match ty.kind() {
                Kind::Domain(base) => return Self::from_sql(base, raw),
                // Enum labels are sent as plain text
                Kind::Enum(_) => serde_json::Value::String(std::str::from_utf8(raw)?.to_string()),
                _ => return Err(format!("unsupported PostgreSQL column type: {}", ty.name()).into()),
            },
        };
        Ok(WireValue(value))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn read_u16(raw: &[u8], at: usize) -> std::result::Result<u16, BoxError> {
    raw.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| "truncated NUMERIC value".into())
}

/// Decode a binary NUMERIC into its exact decimal text, keeping the display scale
fn decode_numeric(raw: &[u8]) -> std::result::Result<String, BoxError> {
    let ndigits = usize::from(read_u16(raw, 0)?);
    let weight = i32::from(read_u16(raw, 2)? as i16);
    let sign = read_u16(raw, 4)?;
    let dscale = usize::from(read_u16(raw, 6)?);

    match sign {
        NUMERIC_POS | NUMERIC_NEG => {}
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        other => return Err(format!("invalid NUMERIC sign {other:#06x}").into()),
    }

    // Base-10000 digit groups; group `i` is worth 10000^(weight - i)
    let digits = (0..ndigits)
        .map(|i| read_u16(raw, 8 + 2 * i))
        .collect::<std::result::Result<Vec<u16>, _>>()?;
    let group = |i: i32| {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        write!(text, "{}", group(0))?;
        for i in 1..=weight {
            write!(text, "{:04}", group(i))?;
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while fraction.len() < dscale {
            write!(fraction, "{:04}", group(i))?;
            i += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Ok(text)
}

/// Numbers that JSON can hold exactly become numbers; anything else keeps its decimal text
fn numeric_to_json(text: String) -> serde_json::Value {
    if let Ok(int) = text.parse::<i64>() {
        return int.into();
    }
    let canonical = if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text.as_str()
    };
    match canonical.parse::<f64>() {
        Ok(float) if float.to_string() == canonical => serde_json::Number::from_f64(float)
            .map_or(serde_json::Value::String(text), serde_json::Value::Number),
        _ => serde_json::Value::String(text),
    }
}

/// Decode a binary INTERVAL (microseconds, days, months) into an ISO 8601 duration
fn decode_interval(raw: &[u8]) -> std::result::Result<String, BoxError> {
    let raw: &[u8; 16] = raw.try_into().map_err(|_| "INTERVAL value must be 16 bytes")?;
    let micros = i64::from_be_bytes(raw[0..8].try_into()?);
    let days = i32::from_be_bytes(raw[8..12].try_into()?);
    let months = i32::from_be_bytes(raw[12..16].try_into()?);
    Ok(format_interval(months, days, micros))
}

fn format_interval(months: i32, days: i32, micros: i64) -> String {
    let mut text = String::from("P");
    let (years, months) = (months / 12, months % 12);
    for (amount, unit) in [(years, 'Y'), (months, 'M'), (days, 'D')] {
        if amount != 0 {
            let _ = write!(text, "{amount}{unit}");
        }
    }

    if micros != 0 {
        let sign = if micros < 0 { "-" } else { "" };
        let magnitude = micros.unsigned_abs();
        let hours = magnitude / MICROS_PER_HOUR;
        let minutes = magnitude % MICROS_PER_HOUR / MICROS_PER_MINUTE;
        let seconds = magnitude % MICROS_PER_MINUTE / MICROS_PER_SECOND;
        let fraction = magnitude % MICROS_PER_SECOND;

        text.push('T');
        if hours != 0 {
            let _ = write!(text, "{sign}{hours}H");
        }
        if minutes != 0 {
            let _ = write!(text, "{sign}{minutes}M");
        }
        if seconds != 0 || fraction != 0 {
            let _ = write!(text, "{sign}{seconds}");
            if fraction != 0 {
                let digits = format!("{fraction:06}");
                let _ = write!(text, ".{}", digits.trim_end_matches('0'));
            }
            text.push('S');
        }
    }

    if text == "P" {
        text.push_str("T0S");
    }
    text
}

fn decode_uuid(raw: &[u8]) -> std::result::Result<String, BoxError> {
    let bytes: &[u8; 16] = raw.try_into().map_err(|_| "UUID value must be 16 bytes")?;
    let mut text = String::with_capacity(36);
    for (i, byte) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            text.push('-');
        }
        write!(text, "{byte:02x}")?;
    }
    Ok(text)
}

fn float_to_json(value: Option<f64>) -> serde_json::Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Map PostgreSQL rows to positional JSON rows
pub fn map_rows_to_json_data(
    rows: &[tokio_postgres::Row],
) -> std::result::Result<Vec<Row>, tokio_postgres::Error> {
    rows.iter()
        .map(|row| {
            (0..row.columns().len())
                .map(|idx| postgres_column_to_json(row, idx))
                .collect()
        })
        .collect()
}

impl Executor<PostgresConnector> {
    /// Build a PostgreSQL executor from configuration
    pub fn postgres(config: &ExecutorConfig) -> Result<Self> {
        config.options.validate()?;
        let pg_config = config.connection.to_postgres_config()?;
        Ok(Executor::new(PostgresConnector::new(pg_config), config.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_json_finite() {
        assert_eq!(float_to_json(Some(1.5)), serde_json::json!(1.5));
    }

    #[test]
    fn test_float_to_json_non_finite_is_null() {
        assert_eq!(float_to_json(Some(f64::NAN)), serde_json::Value::Null);
        assert_eq!(float_to_json(Some(f64::INFINITY)), serde_json::Value::Null);
    }

    #[test]
    fn test_float_to_json_null() {
        assert_eq!(float_to_json(None), serde_json::Value::Null);
    }

    #[test]
    fn test_to_json_null_and_values() {
        assert_eq!(to_json::<i64>(None), serde_json::Value::Null);
        assert_eq!(to_json(Some(7_i32)), serde_json::json!(7));
        assert_eq!(to_json(Some("abc".to_string())), serde_json::json!("abc"));
        assert_eq!(to_json(Some(vec![1_u8, 255])), serde_json::json!([1, 255]));
    }

    fn numeric_bytes(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for digit in digits {
            raw.extend_from_slice(&digit.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        let cases = [
            (numeric_bytes(0, NUMERIC_POS, 1, &[1, 5000]), "1.5"),
            (numeric_bytes(0, NUMERIC_POS, 2, &[1, 5000]), "1.50"),
            (numeric_bytes(1, NUMERIC_POS, 3, &[1, 2345, 6780]), "12345.678"),
            (numeric_bytes(1, NUMERIC_POS, 0, &[1]), "10000"),
            (numeric_bytes(0, NUMERIC_NEG, 0, &[42]), "-42"),
            (numeric_bytes(-1, NUMERIC_POS, 5, &[1, 2000]), "0.00012"),
            (numeric_bytes(-2, NUMERIC_POS, 9, &[1200]), "0.000000012"),
            (numeric_bytes(0, NUMERIC_POS, 0, &[]), "0"),
            (numeric_bytes(0, NUMERIC_NAN, 0, &[]), "NaN"),
        ];
        for (raw, expected) in cases {
            assert_eq!(decode_numeric(&raw).unwrap(), expected);
        }
        assert!(decode_numeric(&[0, 2, 0, 0]).is_err());
    }

    #[test]
    fn test_numeric_to_json() {
        assert_eq!(numeric_to_json("6".to_string()), serde_json::json!(6));
        assert_eq!(numeric_to_json("-1.50".to_string()), serde_json::json!(-1.5));
        assert_eq!(numeric_to_json("3.00".to_string()), serde_json::json!(3.0));
        // Values a float cannot hold exactly keep their decimal text
        assert_eq!(
            numeric_to_json("123456789012345678901234567890.5".to_string()),
            serde_json::json!("123456789012345678901234567890.5")
        );
        assert_eq!(numeric_to_json("NaN".to_string()), serde_json::json!("NaN"));
    }

    #[test]
    fn test_format_interval() {
        let micros = 4 * MICROS_PER_HOUR + 5 * MICROS_PER_MINUTE + 6_500_000;
        assert_eq!(format_interval(14, 3, micros as i64), "P1Y2M3DT4H5M6.5S");
        assert_eq!(format_interval(0, 1, 0), "P1D");
        assert_eq!(format_interval(0, 0, -1_500_000), "PT-1.5S");
        assert_eq!(format_interval(0, 0, 0), "PT0S");
    }

    #[test]
    fn test_decode_uuid() {
        let raw: Vec<u8> = (0..16).collect();
        assert_eq!(
            decode_uuid(&raw).unwrap(),
            "00010203-0405-0607-0809-0a0b0c0d0e0f"
        );
        assert!(decode_uuid(&raw[..8]).is_err());
    }

    #[test]
    fn test_wire_value_void_and_unsupported() {
        let void = WireValue::from_sql(&Type::VOID, &[]).unwrap();
        assert_eq!(void.0, serde_json::Value::Null);

        match WireValue::from_sql(&Type::INET, &[2, 32, 0, 4, 127, 0, 0, 1]) {
            Err(err) => assert!(err.to_string().contains("inet")),
            Ok(value) => panic!("Expected unsupported type error, got: {}", value.0),
        }
    }

    #[test]
    fn test_statement_timeout_sql_is_clamped() {
        assert_eq!(
            statement_timeout_sql(Duration::from_millis(50)),
            "SET statement_timeout TO 50"
        );
        assert_eq!(
            statement_timeout_sql(Duration::from_millis(u64::from(u32::MAX))),
            "SET statement_timeout TO 2147483647"
        );
    }

    #[test]
    fn test_postgres_executor_rejects_invalid_encoding() {
        let config = ExecutorConfig {
            connection: crate::ConnectionParams::new("db", "user").with_client_encoding("latin1"),
            options: Default::default(),
        };
        assert!(matches!(
            Executor::postgres(&config),
            Err(crate::FanoutError::Config(_))
        ));
    }
}
