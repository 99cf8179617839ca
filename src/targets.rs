//! Scan target sources

use crate::error::TargetRetrievalError;
use crate::model::ScanTarget;
use async_trait::async_trait;
use log::{info, warn};
use sqlx::{PgPool, Row};

/// Latest address per identity
const LATEST_PEERS: &str = r#"
    SELECT DISTINCT ON (identity_key)
        identity_key,
        ip_address
    FROM gossip_peers
    WHERE ip_address IS NOT NULL
      AND identity_key IS NOT NULL
    ORDER BY identity_key, timestamp DESC
"#;

/// Latest address per identity whose latest validator state meets the stake floor
const STAKED_PEERS: &str = r#"
    SELECT DISTINCT ON (g.identity_key)
        g.identity_key,
        g.ip_address
    FROM gossip_peers g
    JOIN (
        SELECT DISTINCT ON (identity_key) identity_key, activated_stake
        FROM validators_state
        ORDER BY identity_key, timestamp DESC
    ) v ON v.identity_key = g.identity_key
    WHERE g.ip_address IS NOT NULL
      AND g.identity_key IS NOT NULL
      AND v.activated_stake >= $1
    ORDER BY g.identity_key, g.timestamp DESC
"#;

/// Where the list of hosts to scan comes from
#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn fetch_targets(&self) -> Result<Vec<ScanTarget>, TargetRetrievalError>;
}

/// Reads targets from the `gossip_peers` table
#[derive(Debug, Clone)]
pub struct PgTargetSource {
    pool: PgPool,
    min_activated_stake: Option<u64>,
}

impl PgTargetSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            min_activated_stake: None,
        }
    }

    /// Only return identities with at least `lamports` activated stake
    pub fn with_min_activated_stake(mut self, lamports: Option<u64>) -> Self {
        self.min_activated_stake = lamports;
        self
    }
}

#[async_trait]
impl TargetSource for PgTargetSource {
    async fn fetch_targets(&self) -> Result<Vec<ScanTarget>, TargetRetrievalError> {
        let rows = match self.min_activated_stake {
            Some(lamports) => {
                let floor = i64::try_from(lamports).map_err(|_| {
                    TargetRetrievalError::InvalidRow(format!("stake floor too large: {}", lamports))
                })?;
                sqlx::query(STAKED_PEERS).bind(floor).fetch_all(&self.pool).await?
            }
            None => sqlx::query(LATEST_PEERS).fetch_all(&self.pool).await?,
        };

        let mut targets = Vec::with_capacity(rows.len());
        for row in rows {
            let identity: String = row.try_get("identity_key")?;
            let address: String = row.try_get("ip_address")?;
            let address = address.trim();
            if address.is_empty() {
                warn!("Skipping {} with blank address", identity);
                continue;
            }
            targets.push(ScanTarget::new(identity, address));
        }

        info!("Retrieved {} unique identities with addresses", targets.len());
        Ok(targets)
    }
}

/// Fixed target list, for `--test-ips` and tests
#[derive(Debug, Clone, Default)]
pub struct StaticTargetSource {
    targets: Vec<ScanTarget>,
}

impl StaticTargetSource {
    pub fn new(targets: Vec<ScanTarget>) -> Self {
        Self { targets }
    }

    /// Synthesize an identity for each bare address
    pub fn from_test_ips<I, S>(ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets = ips
            .into_iter()
            .map(|ip| {
                let ip = ip.as_ref().trim();
                ScanTarget::new(format!("test_identity_{}", ip.replace('.', "_")), ip)
            })
            .collect();
        Self { targets }
    }
}

#[async_trait]
impl TargetSource for StaticTargetSource {
    async fn fetch_targets(&self) -> Result<Vec<ScanTarget>, TargetRetrievalError> {
        Ok(self.targets.clone())
    }
}
