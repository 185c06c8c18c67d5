//! Query helpers for the SQL backend.
//!
//! Each helper runs in its own transaction and does nothing beyond composing
//! SQL. Conditional updates report a zero-row match as
//! [`IpamError::NotUpdated`].

use super::DbIpam;
use crate::error::IpamError;
use crate::ipam::{FloatingIp, ReleasePolicy};
use crate::nets::IpRange;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::net::Ipv4Addr;

const COLUMNS: &str = r#"ip, "key", subnet, policy, attr, updated_at"#;

// keeps bound parameters per statement well below SQLite's limit
const BATCH_SIZE: usize = 500;

#[derive(Debug, sqlx::FromRow)]
struct IpRow {
    ip: i64,
    key: String,
    subnet: String,
    policy: i64,
    attr: String,
    updated_at: i64,
}

impl TryFrom<IpRow> for FloatingIp {
    type Error = IpamError;

    fn try_from(row: IpRow) -> Result<Self, Self::Error> {
        let ip = u32::try_from(row.ip)
            .map_err(|_| IpamError::Corrupt(format!("ip column out of range: {}", row.ip)))?;
        let updated_at = DateTime::<Utc>::from_timestamp_micros(row.updated_at)
            .ok_or_else(|| IpamError::Corrupt(format!("bad timestamp {} for ip {ip}", row.updated_at)))?;
        Ok(Self {
            ip: Ipv4Addr::from(ip),
            key: row.key,
            subnet: row.subnet,
            policy: ReleasePolicy::from_code(u16::try_from(row.policy).unwrap_or_default()),
            attr: row.attr,
            updated_at,
        })
    }
}

fn ip_param(ip: Ipv4Addr) -> i64 {
    i64::from(u32::from(ip))
}

fn policy_param(policy: ReleasePolicy) -> i64 {
    i64::from(policy.code())
}

fn now_param() -> i64 {
    Utc::now().timestamp_micros()
}

fn push_range_filter(builder: &mut QueryBuilder<'_, Sqlite>, ranges: &[IpRange]) {
    if ranges.is_empty() {
        return;
    }
    builder.push(" AND (");
    let mut separated = builder.separated(" OR ");
    for range in ranges {
        separated
            .push("ip BETWEEN ")
            .push_bind_unseparated(ip_param(range.first))
            .push_unseparated(" AND ")
            .push_bind_unseparated(ip_param(range.last));
    }
    separated.push_unseparated(")");
}

fn into_records(rows: Vec<IpRow>) -> Result<Vec<FloatingIp>, IpamError> {
    rows.into_iter().map(FloatingIp::try_from).collect()
}

fn expect_one(rows_affected: u64) -> Result<(), IpamError> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err(IpamError::NotUpdated)
    }
}

impl DbIpam {
    pub(crate) async fn create_table(&self) -> Result<(), IpamError> {
        let mut tx = self.db.begin().await?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {t} (
                ip INTEGER PRIMARY KEY NOT NULL,
                "key" TEXT NOT NULL DEFAULT '',
                subnet TEXT NOT NULL DEFAULT '',
                policy INTEGER NOT NULL DEFAULT 0,
                attr TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL DEFAULT 0
            )"#,
            t = self.table
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            r#"CREATE INDEX IF NOT EXISTS {t}_key ON {t} ("key")"#,
            t = self.table
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn find_all(&self) -> Result<Vec<FloatingIp>, IpamError> {
        let sql = format!("SELECT {COLUMNS} FROM {} ORDER BY ip", self.table);
        let mut tx = self.db.begin().await?;
        let rows = sqlx::query_as::<_, IpRow>(&sql).fetch_all(&mut *tx).await?;
        tx.commit().await?;
        into_records(rows)
    }

    pub(crate) async fn find_by_ip(&self, ip: Ipv4Addr) -> Result<Option<FloatingIp>, IpamError> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE ip = ?", self.table);
        let mut tx = self.db.begin().await?;
        let row = sqlx::query_as::<_, IpRow>(&sql)
            .bind(ip_param(ip))
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.map(FloatingIp::try_from).transpose()
    }

    pub(crate) async fn find_by_key(&self, key: &str) -> Result<Vec<FloatingIp>, IpamError> {
        let sql = format!(r#"SELECT {COLUMNS} FROM {} WHERE "key" = ? ORDER BY ip"#, self.table);
        let mut tx = self.db.begin().await?;
        let rows = sqlx::query_as::<_, IpRow>(&sql)
            .bind(key)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        into_records(rows)
    }

    pub(crate) async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<FloatingIp>, IpamError> {
        let sql = format!(
            r#"SELECT {COLUMNS} FROM {} WHERE substr("key", 1, length(?)) = ? ORDER BY ip"#,
            self.table
        );
        let mut tx = self.db.begin().await?;
        let rows = sqlx::query_as::<_, IpRow>(&sql)
            .bind(prefix)
            .bind(prefix)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        into_records(rows)
    }

    pub(crate) async fn find_by_keyword(&self, keyword: &str) -> Result<Vec<FloatingIp>, IpamError> {
        let sql = format!(
            r#"SELECT {COLUMNS} FROM {} WHERE ? = '' OR instr("key", ?) > 0 ORDER BY ip"#,
            self.table
        );
        let mut tx = self.db.begin().await?;
        let rows = sqlx::query_as::<_, IpRow>(&sql)
            .bind(keyword)
            .bind(keyword)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        into_records(rows)
    }

    /// Claims the lowest free IP of `subnet` in one statement.
    pub(crate) async fn allocate_one_in_subnet(
        &self,
        key: &str,
        subnet: &str,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<Ipv4Addr, IpamError> {
        let sql = format!(
            r#"UPDATE {t} SET "key" = ?, policy = ?, attr = ?, updated_at = ?
               WHERE "key" = '' AND ip = (
                   SELECT ip FROM {t} WHERE "key" = '' AND subnet = ? ORDER BY ip LIMIT 1
               )
               RETURNING ip"#,
            t = self.table
        );
        let mut tx = self.db.begin().await?;
        let ip = sqlx::query_scalar::<_, i64>(&sql)
            .bind(key)
            .bind(policy_param(policy))
            .bind(attr)
            .bind(now_param())
            .bind(subnet)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        let ip = ip.ok_or(IpamError::NotUpdated)?;
        u32::try_from(ip)
            .map(Ipv4Addr::from)
            .map_err(|_| IpamError::Corrupt(format!("ip column out of range: {ip}")))
    }

    /// Claims, in one transaction, the lowest free IP of `subnet` inside each
    /// range set. Rolls back and reports [`IpamError::NotUpdated`] if a set
    /// has no free IP left.
    pub(crate) async fn allocate_in_ranges(
        &self,
        key: &str,
        subnet: &str,
        ip_ranges: &[Vec<IpRange>],
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<Vec<Ipv4Addr>, IpamError> {
        let now = now_param();
        let mut ips = Vec::with_capacity(ip_ranges.len());
        let mut tx = self.db.begin().await?;
        for ranges in ip_ranges {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new(format!(r#"UPDATE {} SET "key" = "#, self.table));
            builder
                .push_bind(key)
                .push(", policy = ")
                .push_bind(policy_param(policy))
                .push(", attr = ")
                .push_bind(attr)
                .push(", updated_at = ")
                .push_bind(now)
                .push(format!(
                    r#" WHERE "key" = '' AND ip = (SELECT ip FROM {} WHERE "key" = '' AND subnet = "#,
                    self.table
                ))
                .push_bind(subnet);
            push_range_filter(&mut builder, ranges);
            builder.push(" ORDER BY ip LIMIT 1) RETURNING ip");
            let ip = builder
                .build_query_scalar::<i64>()
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(IpamError::NotUpdated)?;
            ips.push(
                u32::try_from(ip)
                    .map(Ipv4Addr::from)
                    .map_err(|_| IpamError::Corrupt(format!("ip column out of range: {ip}")))?,
            );
        }
        tx.commit().await?;
        Ok(ips)
    }

    /// Claims `ip` if it is free.
    pub(crate) async fn allocate_specific(
        &self,
        ip: Ipv4Addr,
        key: &str,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError> {
        let sql = format!(
            r#"UPDATE {} SET "key" = ?, policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND "key" = ''"#,
            self.table
        );
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(&sql)
            .bind(key)
            .bind(policy_param(policy))
            .bind(attr)
            .bind(now_param())
            .bind(ip_param(ip))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        expect_one(result.rows_affected())
    }

    /// Re-keys the most recently updated record of `old_key` in `subnet`.
    pub(crate) async fn update_one_in_subnet(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: &str,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError> {
        let sql = format!(
            r#"UPDATE {t} SET "key" = ?, policy = ?, attr = ?, updated_at = ?
               WHERE "key" = ? AND ip = (
                   SELECT ip FROM {t} WHERE "key" = ? AND subnet = ?
                   ORDER BY updated_at DESC, ip DESC LIMIT 1
               )"#,
            t = self.table
        );
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(&sql)
            .bind(new_key)
            .bind(policy_param(policy))
            .bind(attr)
            .bind(now_param())
            .bind(old_key)
            .bind(old_key)
            .bind(subnet)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        expect_one(result.rows_affected())
    }

    /// Re-keys the most recently updated record of `old_key`, keeping its policy.
    pub(crate) async fn update_key(&self, old_key: &str, new_key: &str, attr: &str) -> Result<(), IpamError> {
        let sql = format!(
            r#"UPDATE {t} SET "key" = ?, attr = ?, updated_at = ?
               WHERE "key" = ? AND ip = (
                   SELECT ip FROM {t} WHERE "key" = ? ORDER BY updated_at DESC, ip DESC LIMIT 1
               )"#,
            t = self.table
        );
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(&sql)
            .bind(new_key)
            .bind(attr)
            .bind(now_param())
            .bind(old_key)
            .bind(old_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        expect_one(result.rows_affected())
    }

    pub(crate) async fn update_policy_of(
        &self,
        ip: Ipv4Addr,
        key: &str,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError> {
        let sql = format!(
            r#"UPDATE {} SET policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND "key" = ?"#,
            self.table
        );
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(&sql)
            .bind(policy_param(policy))
            .bind(attr)
            .bind(now_param())
            .bind(ip_param(ip))
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        expect_one(result.rows_affected())
    }

    /// Clears the owner of `ip` if it is `key`. Returns the number of rows changed.
    pub(crate) async fn release_ip(&self, ip: Ipv4Addr, key: &str) -> Result<u64, IpamError> {
        let sql = format!(
            r#"UPDATE {} SET "key" = '', policy = 0, attr = '', updated_at = ?
               WHERE ip = ? AND "key" = ? AND "key" != ''"#,
            self.table
        );
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(&sql)
            .bind(now_param())
            .bind(ip_param(ip))
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub(crate) async fn release_by_prefix_rows(&self, prefix: &str) -> Result<u64, IpamError> {
        let sql = format!(
            r#"UPDATE {} SET "key" = '', policy = 0, attr = '', updated_at = ?
               WHERE "key" != '' AND substr("key", 1, length(?)) = ?"#,
            self.table
        );
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(&sql)
            .bind(now_param())
            .bind(prefix)
            .bind(prefix)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Inserts records, skipping IPs that already have a row.
    pub(crate) async fn create(&self, records: &[FloatingIp]) -> Result<u64, IpamError> {
        let mut inserted = 0;
        let mut tx = self.db.begin().await?;
        for chunk in records.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new(format!("INSERT OR IGNORE INTO {} ({COLUMNS}) ", self.table));
            builder.push_values(chunk, |mut row, fip| {
                row.push_bind(ip_param(fip.ip))
                    .push_bind(fip.key.as_str())
                    .push_bind(fip.subnet.as_str())
                    .push_bind(policy_param(fip.policy))
                    .push_bind(fip.attr.as_str())
                    .push_bind(fip.updated_at.timestamp_micros());
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Deletes the rows of IPs that left every pool.
    pub(crate) async fn delete_unscoped(&self, ips: &[Ipv4Addr]) -> Result<u64, IpamError> {
        let mut deleted = 0;
        let mut tx = self.db.begin().await?;
        for chunk in ips.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new(format!("DELETE FROM {} WHERE ip IN (", self.table));
            let mut separated = builder.separated(", ");
            for ip in chunk {
                separated.push_bind(ip_param(*ip));
            }
            separated.push_unseparated(")");
            deleted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// Moves rows to another routable subnet after a pool was re-homed.
    pub(crate) async fn update_subnet(&self, ips: &[Ipv4Addr], subnet: &str) -> Result<u64, IpamError> {
        let mut updated = 0;
        let mut tx = self.db.begin().await?;
        for chunk in ips.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new(format!("UPDATE {} SET subnet = ", self.table));
            builder.push_bind(subnet).push(" WHERE ip IN (");
            let mut separated = builder.separated(", ");
            for ip in chunk {
                separated.push_bind(ip_param(*ip));
            }
            separated.push_unseparated(")");
            updated += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    pub(crate) async fn query_by_key_group_by_subnet(&self, key: &str) -> Result<Vec<String>, IpamError> {
        let sql = format!(
            r#"SELECT subnet FROM {} WHERE "key" = ? GROUP BY subnet ORDER BY subnet"#,
            self.table
        );
        let mut tx = self.db.begin().await?;
        let subnets = sqlx::query_scalar::<_, String>(&sql)
            .bind(key)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(subnets)
    }

    pub(crate) async fn count_allocated_by_subnet(&self) -> Result<HashMap<String, u64>, IpamError> {
        let sql = format!(
            r#"SELECT subnet, COUNT(*) FROM {} WHERE "key" != '' GROUP BY subnet"#,
            self.table
        );
        let mut tx = self.db.begin().await?;
        let rows = sqlx::query_as::<_, (String, i64)>(&sql).fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(rows
            .into_iter()
            .map(|(subnet, count)| (subnet, u64::try_from(count).unwrap_or_default()))
            .collect())
    }
}
