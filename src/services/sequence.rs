//! Human-readable, collision-free identifiers.
//!
//! Order numbers look like `ORD-20240115-007` and are bucketed per calendar
//! day. Invoice numbers look like `INV/III/24/0042` and are bucketed per
//! calendar month of the invoice date. Each bucket has one row in
//! `sequence_counters`; allocation reads that row under a write lock and
//! increments it, so concurrent allocators in one bucket queue behind each
//! other until the holder's transaction ends. A rolled back transaction
//! discards its number, which may leave a gap but never a duplicate.

use chrono::{Datelike, NaiveDate, Utc};
use metrics::counter;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set,
};
use tracing::{debug, instrument};

use crate::entities::sequence_counter::{self, Entity as SequenceCounter};
use crate::errors::ServiceError;
use crate::repositories::{NumberColumn, OrderRepository};

pub const ORDER_SCOPE: &str = "order_number";
pub const INVOICE_SCOPE: &str = "invoice_number";

const ORDER_SEQ_WIDTH: usize = 3;
const INVOICE_SEQ_WIDTH: usize = 4;

const ROMAN_MONTHS: [&str; 12] = [
    "I", "II", "III", "IV", "V", "VI", "VII", "VIII", "IX", "X", "XI", "XII",
];

/// Roman numeral for a 1-based month.
pub fn roman_month(month: u32) -> Option<&'static str> {
    ROMAN_MONTHS.get(month.checked_sub(1)? as usize).copied()
}

pub fn order_bucket(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn invoice_bucket(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

pub fn format_order_number(prefix: &str, date: NaiveDate, seq: i32) -> String {
    format!(
        "{}-{}-{:0width$}",
        prefix,
        order_bucket(date),
        seq,
        width = ORDER_SEQ_WIDTH
    )
}

pub fn format_invoice_number(prefix: &str, date: NaiveDate, seq: i32) -> String {
    format!(
        "{}/{}/{:02}/{:0width$}",
        prefix,
        invoice_month_stem(date),
        date.year() % 100,
        seq,
        width = INVOICE_SEQ_WIDTH
    )
}

// Months are always 1..=12 for a valid date.
fn invoice_month_stem(date: NaiveDate) -> &'static str {
    roman_month(date.month()).unwrap_or("I")
}

/// Numeric suffix after the last `separator`, if it parses.
pub fn parse_sequence_suffix(identifier: &str, separator: char) -> Option<i32> {
    identifier
        .rsplit(separator)
        .next()
        .and_then(|suffix| suffix.parse::<i32>().ok())
}

/// True when both dates fall into the same invoice bucket.
pub fn same_invoice_month(a: NaiveDate, b: NaiveDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

#[derive(Debug, Clone)]
pub struct SequenceAllocator {
    orders: OrderRepository,
    order_prefix: String,
    invoice_prefix: String,
}

impl SequenceAllocator {
    pub fn new(orders: OrderRepository, order_prefix: String, invoice_prefix: String) -> Self {
        Self {
            orders,
            order_prefix,
            invoice_prefix,
        }
    }

    /// Next order number in the bucket of `day`.
    #[instrument(skip(self, conn))]
    pub async fn next_order_number<C: ConnectionTrait>(
        &self,
        conn: &C,
        day: NaiveDate,
    ) -> Result<String, ServiceError> {
        let pattern = format!("{}-{}-%", self.order_prefix, order_bucket(day));
        let seq = self
            .allocate(
                conn,
                ORDER_SCOPE,
                &order_bucket(day),
                NumberColumn::OrderNumber,
                &pattern,
                '-',
            )
            .await?;
        Ok(format_order_number(&self.order_prefix, day, seq))
    }

    /// Next invoice number in the month bucket of `invoice_date`.
    #[instrument(skip(self, conn))]
    pub async fn next_invoice_number<C: ConnectionTrait>(
        &self,
        conn: &C,
        invoice_date: NaiveDate,
    ) -> Result<String, ServiceError> {
        let pattern = format!(
            "{}/{}/{:02}/%",
            self.invoice_prefix,
            invoice_month_stem(invoice_date),
            invoice_date.year() % 100
        );
        let seq = self
            .allocate(
                conn,
                INVOICE_SCOPE,
                &invoice_bucket(invoice_date),
                NumberColumn::InvoiceNumber,
                &pattern,
                '/',
            )
            .await?;
        Ok(format_invoice_number(&self.invoice_prefix, invoice_date, seq))
    }

    /// Read-increment-write of one bucket's counter, holding its row lock
    /// until the caller's transaction ends.
    async fn allocate<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &str,
        bucket: &str,
        seed_column: NumberColumn,
        seed_pattern: &str,
        separator: char,
    ) -> Result<i32, ServiceError> {
        let counter = match self.lock_counter(conn, scope, bucket).await? {
            Some(counter) => counter,
            None => {
                // First allocation in this bucket: continue from whatever
                // identifiers already exist, then take the row lock.
                let seed = self
                    .orders
                    .numbers_like(conn, seed_column, seed_pattern)
                    .await?
                    .iter()
                    .filter_map(|number| parse_sequence_suffix(number, separator))
                    .max()
                    .unwrap_or(0);

                SequenceCounter::insert(sequence_counter::ActiveModel {
                    scope: Set(scope.to_string()),
                    bucket: Set(bucket.to_string()),
                    last_value: Set(seed),
                    updated_at: Set(Utc::now()),
                    ..Default::default()
                })
                .on_conflict(
                    OnConflict::columns([
                        sequence_counter::Column::Scope,
                        sequence_counter::Column::Bucket,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(conn)
                .await
                .map_err(ServiceError::db_error)?;

                self.lock_counter(conn, scope, bucket)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::InternalError(format!(
                            "sequence counter {}/{} vanished after insert",
                            scope, bucket
                        ))
                    })?
            }
        };

        let next = counter.last_value + 1;
        let mut active: sequence_counter::ActiveModel = counter.into();
        active.last_value = Set(next);
        active.update(conn).await.map_err(ServiceError::db_error)?;

        counter!("order_ledger.sequence.allocated", 1, "scope" => scope.to_string());
        debug!(scope, bucket, value = next, "Allocated sequence value");
        Ok(next)
    }

    async fn lock_counter<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: &str,
        bucket: &str,
    ) -> Result<Option<sequence_counter::Model>, ServiceError> {
        SequenceCounter::find()
            .filter(sequence_counter::Column::Scope.eq(scope))
            .filter(sequence_counter::Column::Bucket.eq(bucket))
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[rstest]
    #[case(1, Some("I"))]
    #[case(4, Some("IV"))]
    #[case(9, Some("IX"))]
    #[case(12, Some("XII"))]
    #[case(0, None)]
    #[case(13, None)]
    fn roman_months(#[case] month: u32, #[case] expected: Option<&str>) {
        assert_eq!(roman_month(month), expected);
    }

    #[test]
    fn order_numbers_are_day_bucketed_and_padded() {
        assert_eq!(
            format_order_number("ORD", date(2024, 1, 15), 7),
            "ORD-20240115-007"
        );
        assert_eq!(
            format_order_number("ORD", date(2024, 1, 15), 1234),
            "ORD-20240115-1234"
        );
    }

    #[test]
    fn invoice_numbers_use_roman_month_and_two_digit_year() {
        assert_eq!(
            format_invoice_number("INV", date(2024, 3, 2), 42),
            "INV/III/24/0042"
        );
        assert_eq!(
            format_invoice_number("INV", date(2030, 11, 30), 1),
            "INV/XI/30/0001"
        );
    }

    #[rstest]
    #[case("ORD-20240115-007", '-', Some(7))]
    #[case("INV/III/24/0042", '/', Some(42))]
    #[case("ORD-20240115-abc", '-', None)]
    fn suffix_parsing(#[case] input: &str, #[case] sep: char, #[case] expected: Option<i32>) {
        assert_eq!(parse_sequence_suffix(input, sep), expected);
    }

    #[test]
    fn invoice_month_comparison_includes_year() {
        assert!(same_invoice_month(date(2024, 3, 1), date(2024, 3, 31)));
        assert!(!same_invoice_month(date(2024, 3, 31), date(2024, 4, 1)));
        assert!(!same_invoice_month(date(2023, 3, 1), date(2024, 3, 1)));
    }
}
