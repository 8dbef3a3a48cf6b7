//! Builders and readers for ledger record values.
//!
//! Reading helpers surface missing or mistyped fields as `corrupt`: a value
//! that does not decode is fatal to the operation that read it.

use crate::amount;
use crate::error::{Error, Result};
use crate::ledger::proto::{value, Record, RecordField, Value};
use bigdecimal::BigDecimal;

pub fn text(s: impl Into<String>) -> Value {
    Value {
        sum: Some(value::Sum::Text(s.into())),
    }
}

pub fn numeric(amount: &BigDecimal) -> Value {
    Value {
        sum: Some(value::Sum::Numeric(amount::format_units(amount))),
    }
}

pub fn party(s: impl Into<String>) -> Value {
    Value {
        sum: Some(value::Sum::Party(s.into())),
    }
}

pub fn contract_id(s: impl Into<String>) -> Value {
    Value {
        sum: Some(value::Sum::ContractId(s.into())),
    }
}

pub fn record(fields: Vec<(&str, Value)>) -> Record {
    Record {
        fields: fields
            .into_iter()
            .map(|(label, value)| RecordField {
                label: label.to_string(),
                value: Some(value),
            })
            .collect(),
    }
}

pub fn record_value(fields: Vec<(&str, Value)>) -> Value {
    Value {
        sum: Some(value::Sum::Record(record(fields))),
    }
}

fn field<'a>(record: &'a Record, label: &str) -> Result<&'a Value> {
    record
        .fields
        .iter()
        .find(|f| f.label == label)
        .and_then(|f| f.value.as_ref())
        .ok_or_else(|| Error::corrupt(format!("record is missing field {label:?}")))
}

pub fn field_text(record: &Record, label: &str) -> Result<String> {
    match &field(record, label)?.sum {
        Some(value::Sum::Text(s)) => Ok(s.clone()),
        _ => Err(Error::corrupt(format!("field {label:?} is not text"))),
    }
}

pub fn field_party(record: &Record, label: &str) -> Result<String> {
    match &field(record, label)?.sum {
        Some(value::Sum::Party(p)) => Ok(p.clone()),
        _ => Err(Error::corrupt(format!("field {label:?} is not a party"))),
    }
}

pub fn field_numeric(record: &Record, label: &str) -> Result<BigDecimal> {
    match &field(record, label)?.sum {
        Some(value::Sum::Numeric(n)) => amount::parse_units(n)
            .map_err(|e| Error::corrupt(format!("field {label:?}: {}", e.message()))),
        _ => Err(Error::corrupt(format!("field {label:?} is not numeric"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn build_and_read_back() {
        let rec = record(vec![
            ("owner", party("user_ab::1220ff")),
            ("symbol", text("PROMPT")),
            ("amount", numeric(&BigDecimal::from_str("10").unwrap())),
        ]);
        assert_eq!(field_party(&rec, "owner").unwrap(), "user_ab::1220ff");
        assert_eq!(field_text(&rec, "symbol").unwrap(), "PROMPT");
        assert_eq!(
            field_numeric(&rec, "amount").unwrap(),
            BigDecimal::from_str("10.000000000000000000").unwrap()
        );
    }

    #[test]
    fn missing_field_is_corrupt() {
        let rec = record(vec![("owner", party("p"))]);
        let err = field_text(&rec, "symbol").unwrap_err();
        assert!(err.message().contains("corrupt"));
    }

    #[test]
    fn mistyped_field_is_corrupt() {
        let rec = record(vec![("amount", text("not-a-number-slot"))]);
        assert!(field_numeric(&rec, "amount").is_err());
    }
}
