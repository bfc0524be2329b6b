//! Deciding what happens to a message that failed
//!
//! Retries are counted by the broker, not by us: every trip through the
//! delay queue dead-letters the message back to the work exchange, and the
//! broker records that in the `x-death` header. The first entry's `count` is
//! the number of delays the message has already had.

use courier_broker::{AMQPValue, FieldTable, ShortString};

const X_DEATH: &str = "x-death";
const COUNT: &str = "count";

/// What became of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Sent and acknowledged
    Delivered,
    /// Republished to the delay exchange and acknowledged
    Delayed,
    /// Rejected without requeueing
    Rejected,
    /// Acknowledged without being sent, with no retries left
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<'a> {
    /// Republish to this exchange
    Delay(&'a str),
    Drop,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    delay_exchange: Option<String>,
    max_retry: u32,
}

impl RetryPolicy {
    /// Without a `delay_exchange` nothing is ever retried
    pub const fn new(delay_exchange: Option<String>, max_retry: u32) -> Self {
        Self {
            delay_exchange,
            max_retry,
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.delay_exchange.is_some()
    }

    pub const fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Decide the fate of a failed message carrying `headers`
    ///
    /// An unreadable `x-death` header counts as no header: the message has
    /// not been delayed before, so it gets its first delay.
    pub fn classify(&self, headers: Option<&FieldTable>) -> Decision<'_> {
        let Some(exchange) = self.delay_exchange.as_deref() else {
            return Decision::Drop;
        };

        match death_count(headers) {
            Some(count) if count >= u64::from(self.max_retry) => Decision::Drop,
            _ => Decision::Delay(exchange),
        }
    }
}

/// The `count` of the first `x-death` entry
///
/// `None` when the header is missing or is not shaped the way the broker
/// writes it. Negative counts read as zero.
pub fn death_count(headers: Option<&FieldTable>) -> Option<u64> {
    let deaths = match headers?.inner().get(&ShortString::from(X_DEATH))? {
        AMQPValue::FieldArray(deaths) => deaths,
        _ => return None,
    };

    let AMQPValue::FieldTable(death) = deaths.as_slice().first()? else {
        return None;
    };

    let count = match death.inner().get(&ShortString::from(COUNT))? {
        AMQPValue::ShortShortInt(count) => i64::from(*count),
        AMQPValue::ShortShortUInt(count) => i64::from(*count),
        AMQPValue::ShortInt(count) => i64::from(*count),
        AMQPValue::ShortUInt(count) => i64::from(*count),
        AMQPValue::LongInt(count) => i64::from(*count),
        AMQPValue::LongUInt(count) => i64::from(*count),
        AMQPValue::LongLongInt(count) => *count,
        _ => return None,
    };

    Some(u64::try_from(count).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use courier_broker::{FieldArray, LongString};
    use pretty_assertions::assert_eq;

    use super::*;

    fn headers(deaths: Vec<AMQPValue>) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert(X_DEATH.into(), AMQPValue::FieldArray(FieldArray::from(deaths)));
        headers
    }

    fn death(count: AMQPValue) -> AMQPValue {
        let mut death = FieldTable::default();
        death.insert(COUNT.into(), count);
        death.insert("queue".into(), AMQPValue::LongString(LongString::from("mailer-delay")));
        AMQPValue::FieldTable(death)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Some("mailer-delay".to_string()), 3)
    }

    #[test]
    fn test_death_count() {
        assert_eq!(death_count(None), None);
        assert_eq!(death_count(Some(&FieldTable::default())), None);
        assert_eq!(
            death_count(Some(&headers(vec![death(AMQPValue::LongLongInt(2))]))),
            Some(2)
        );
        assert_eq!(
            death_count(Some(&headers(vec![death(AMQPValue::LongInt(1))]))),
            Some(1)
        );
        assert_eq!(
            death_count(Some(&headers(vec![death(AMQPValue::ShortShortUInt(4))]))),
            Some(4)
        );
    }

    #[test]
    fn test_death_count_uses_first_entry() {
        let headers = headers(vec![
            death(AMQPValue::LongLongInt(1)),
            death(AMQPValue::LongLongInt(7)),
        ]);

        assert_eq!(death_count(Some(&headers)), Some(1));
    }

    #[test]
    fn test_death_count_malformed() {
        assert_eq!(death_count(Some(&headers(vec![]))), None);
        assert_eq!(
            death_count(Some(&headers(vec![AMQPValue::LongString(LongString::from(
                "not-a-table"
            ))]))),
            None
        );
        assert_eq!(
            death_count(Some(&headers(vec![death(AMQPValue::LongString(
                LongString::from("3")
            ))]))),
            None
        );
        assert_eq!(
            death_count(Some(&headers(vec![AMQPValue::FieldTable(FieldTable::default())]))),
            None
        );

        let mut not_an_array = FieldTable::default();
        not_an_array.insert(X_DEATH.into(), AMQPValue::LongString(LongString::from("x")));
        assert_eq!(death_count(Some(&not_an_array)), None);
    }

    #[test]
    fn test_negative_count_is_zero() {
        assert_eq!(
            death_count(Some(&headers(vec![death(AMQPValue::LongLongInt(-5))]))),
            Some(0)
        );
    }

    #[test]
    fn test_first_failure_is_delayed() {
        assert_eq!(policy().classify(None), Decision::Delay("mailer-delay"));
    }

    #[test]
    fn test_malformed_header_is_delayed() {
        let headers = headers(vec![AMQPValue::LongString(LongString::from("not-a-table"))]);

        assert_eq!(policy().classify(Some(&headers)), Decision::Delay("mailer-delay"));
    }

    #[test]
    fn test_boundary() {
        let policy = policy();

        for count in 0..3 {
            let headers = headers(vec![death(AMQPValue::LongLongInt(count))]);
            assert_eq!(
                policy.classify(Some(&headers)),
                Decision::Delay("mailer-delay"),
                "count {count}"
            );
        }

        for count in [3, 4, 100] {
            let headers = headers(vec![death(AMQPValue::LongLongInt(count))]);
            assert_eq!(policy.classify(Some(&headers)), Decision::Drop, "count {count}");
        }
    }

    #[test]
    fn test_disabled_always_drops() {
        let policy = RetryPolicy::new(None, 3);

        assert!(!policy.is_enabled());
        assert_eq!(policy.classify(None), Decision::Drop);
    }

    #[test]
    fn test_zero_max_retry_drops_only_counted_messages() {
        let policy = RetryPolicy::new(Some("mailer-delay".to_string()), 0);
        let counted = headers(vec![death(AMQPValue::LongLongInt(0))]);

        assert_eq!(policy.classify(None), Decision::Delay("mailer-delay"));
        assert_eq!(policy.classify(Some(&counted)), Decision::Drop);
    }
}
