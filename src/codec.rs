//! 컬럼 타입별 값 변환 (JSON / SQL 리터럴)
//!
//! 디코더가 준 `CellValue` 와 컬럼 정의를 받아 출력 값을 만듭니다.
//! 선언 타입과 맞지 않는 값은 `CastFailure` 로 알려주고, 호출자가
//! 데이터베이스/테이블 정보를 붙여 `CdcError::ColumnCast` 로 바꿉니다.

use crate::error::CdcError;
use crate::events::CellValue;
use crate::schema::ColumnDef;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Number, Value};
use std::fmt;

/// 값 변환 실패
#[derive(Debug, Clone, PartialEq)]
pub struct CastFailure {
    pub column: String,
    pub column_type: String,
    pub value: String,
}

impl CastFailure {
    fn new(column: &ColumnDef, value: &CellValue) -> Self {
        CastFailure {
            column: column.name.clone(),
            column_type: column.column_type.clone(),
            value: format!("{:?}", value),
        }
    }

    pub fn into_error(self, database: &str, table: &str) -> CdcError {
        CdcError::ColumnCast {
            database: database.to_string(),
            table: table.to_string(),
            column: self.column,
            column_type: self.column_type,
            value: self.value,
        }
    }
}

impl fmt::Display for CastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot cast {} to {} for column {}", self.value, self.column_type, self.column)
    }
}

pub type CastResult<T> = std::result::Result<T, CastFailure>;

pub trait ColumnCodec: Send + Sync {
    fn to_json(&self, column: &ColumnDef, value: &CellValue) -> CastResult<Value>;

    fn to_sql(&self, column: &ColumnDef, value: &CellValue) -> CastResult<String>;
}

/// MySQL 기본 타입 규칙
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultColumnCodec;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 부호 있는 셀을 컬럼 폭에 맞는 부호 없는 값으로 재해석
fn unsigned_value(column: &ColumnDef, value: &CellValue) -> Option<u64> {
    match *value {
        CellValue::Int8(v) => Some(v as u8 as u64),
        CellValue::Int16(v) => Some(v as u16 as u64),
        CellValue::Int32(v) if column.column_type == "mediumint" && v < 0 => {
            Some((v as i64 + (1 << 24)) as u64)
        }
        CellValue::Int32(v) => Some(v as u32 as u64),
        CellValue::Int64(v) => Some(v as u64),
        CellValue::UInt8(v) => Some(v as u64),
        CellValue::UInt16(v) => Some(v as u64),
        CellValue::UInt32(v) => Some(v as u64),
        CellValue::UInt64(v) => Some(v),
        _ => None,
    }
}

fn float_value(value: &CellValue) -> Option<Value> {
    let v = match *value {
        CellValue::Float(v) => v as f64,
        CellValue::Double(v) => v,
        _ => return value.as_i64().map(|i| json!(i)),
    };
    Number::from_f64(v).map(Value::Number)
}

fn format_datetime(column: &ColumnDef, dt: &chrono::DateTime<chrono::Utc>) -> String {
    let precision = column.column_length.unwrap_or(0).min(6) as usize;
    if precision == 0 {
        dt.format(DATETIME_FORMAT).to_string()
    } else {
        let full = dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string();
        full[..20 + precision].to_string()
    }
}

fn quote_sql(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "''"))
}

impl DefaultColumnCodec {
    fn enum_value(&self, column: &ColumnDef, value: &CellValue) -> CastResult<Value> {
        let values = column.enum_values.as_deref().unwrap_or(&[]);
        match value {
            CellValue::Enum(0) => Ok(json!("")),
            CellValue::Enum(index) => values
                .get(*index as usize - 1)
                .map(|v| json!(v))
                .ok_or_else(|| CastFailure::new(column, value)),
            CellValue::String(s) => Ok(json!(s)),
            _ => Err(CastFailure::new(column, value)),
        }
    }

    fn set_value(&self, column: &ColumnDef, value: &CellValue) -> CastResult<Value> {
        let values = column.enum_values.as_deref().unwrap_or(&[]);
        match value {
            CellValue::Set(mask) => {
                if values.len() < 64 && (mask >> values.len()) != 0 {
                    return Err(CastFailure::new(column, value));
                }
                let members: Vec<&String> = values
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1u64 << i) != 0)
                    .map(|(_, v)| v)
                    .collect();
                Ok(json!(members))
            }
            CellValue::String(s) if s.is_empty() => Ok(json!([])),
            CellValue::String(s) => Ok(json!(s.split(',').collect::<Vec<_>>())),
            _ => Err(CastFailure::new(column, value)),
        }
    }
}

impl ColumnCodec for DefaultColumnCodec {
    fn to_json(&self, column: &ColumnDef, value: &CellValue) -> CastResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let fail = || CastFailure::new(column, value);

        match column.column_type.as_str() {
            "bit" => match value {
                CellValue::Bytes(bytes) if bytes.len() <= 8 => {
                    Ok(json!(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)))
                }
                other => unsigned_value(column, other).map(|v| json!(v)).ok_or_else(fail),
            },
            _ if column.is_integer() => {
                if column.signed {
                    value.as_i64().map(|v| json!(v)).ok_or_else(fail)
                } else {
                    unsigned_value(column, value).map(|v| json!(v)).ok_or_else(fail)
                }
            }
            "year" => value.as_i64().map(|v| json!(v)).ok_or_else(fail),
            "float" | "double" | "real" => float_value(value).ok_or_else(fail),
            "decimal" | "numeric" => match value {
                CellValue::Decimal(s) | CellValue::String(s) => {
                    s.parse::<Number>().map(Value::Number).map_err(|_| fail())
                }
                other => float_value(other).ok_or_else(fail),
            },
            "enum" => self.enum_value(column, value),
            "set" => self.set_value(column, value),
            "json" => match value {
                CellValue::Json(v) => Ok(v.clone()),
                CellValue::String(s) => serde_json::from_str(s).map_err(|_| fail()),
                _ => Err(fail()),
            },
            "datetime" | "timestamp" => match value {
                CellValue::DateTime(dt) => Ok(json!(format_datetime(column, dt))),
                CellValue::String(s) => Ok(json!(s)),
                other => other
                    .as_i64()
                    .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                    .map(|dt| json!(format_datetime(column, &dt)))
                    .ok_or_else(fail),
            },
            "date" => match value {
                CellValue::Date(s) | CellValue::String(s) => Ok(json!(s)),
                CellValue::DateTime(dt) => Ok(json!(dt.format("%Y-%m-%d").to_string())),
                _ => Err(fail()),
            },
            "time" => match value {
                CellValue::Time(s) | CellValue::String(s) => Ok(json!(s)),
                _ => Err(fail()),
            },
            _ if column.is_binary() => match value {
                CellValue::Bytes(bytes) => Ok(json!(STANDARD.encode(bytes))),
                CellValue::String(s) => Ok(json!(STANDARD.encode(s.as_bytes()))),
                _ => Err(fail()),
            },
            _ if column.is_string() => match value {
                CellValue::String(s) => Ok(json!(s)),
                CellValue::Bytes(bytes) => String::from_utf8(bytes.clone())
                    .map(Value::String)
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            _ => Ok(generic_json(value)),
        }
    }

    fn to_sql(&self, column: &ColumnDef, value: &CellValue) -> CastResult<String> {
        if value.is_null() {
            return Ok("NULL".to_string());
        }
        if column.is_binary() && column.column_type != "bit" {
            if let CellValue::Bytes(bytes) = value {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                return Ok(format!("x'{}'", hex));
            }
        }

        match self.to_json(column, value)? {
            Value::Null => Ok("NULL".to_string()),
            Value::Bool(b) => Ok(if b { "1" } else { "0" }.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::String(s) => Ok(quote_sql(&s)),
            Value::Array(items) => {
                let members: Vec<String> = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect();
                Ok(quote_sql(&members.join(",")))
            }
            other @ Value::Object(_) => Ok(quote_sql(&other.to_string())),
        }
    }
}

/// 선언 타입을 모를 때 값 자체의 모양대로 변환
fn generic_json(value: &CellValue) -> Value {
    match value {
        CellValue::Null => Value::Null,
        CellValue::Int8(v) => json!(v),
        CellValue::Int16(v) => json!(v),
        CellValue::Int32(v) => json!(v),
        CellValue::Int64(v) => json!(v),
        CellValue::UInt8(v) => json!(v),
        CellValue::UInt16(v) => json!(v),
        CellValue::UInt32(v) => json!(v),
        CellValue::UInt64(v) => json!(v),
        CellValue::Float(v) => Number::from_f64(*v as f64).map_or(Value::Null, Value::Number),
        CellValue::Double(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
        CellValue::String(s) | CellValue::Date(s) | CellValue::Time(s) | CellValue::Decimal(s) => {
            json!(s)
        }
        CellValue::Bytes(bytes) => json!(STANDARD.encode(bytes)),
        CellValue::DateTime(dt) => json!(dt.format(DATETIME_FORMAT).to_string()),
        CellValue::Json(v) => v.clone(),
        CellValue::Enum(i) => json!(i),
        CellValue::Set(mask) => json!(mask),
    }
}
