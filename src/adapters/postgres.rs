use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::path::PathBuf;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{Checkpoint, ProviderDeal, RetryPolicy, SlotPlacement};
use crate::error::{ProvdError, Result};
use crate::provider::DealStore;

const DEAL_COLUMNS: &str = r#"
    deal_uuid, created_at, signed_proposal_id, client_deal_proposal, client_peer_id,
    deal_data_root, transfer, inbound_file_path, is_offline, checkpoint, checkpoint_at,
    retry, error, publish_cid, chain_deal_id, slot_number, slot_offset, slot_length,
    cleanup_done
"#;

/// PostgreSQL deal store
#[derive(Clone)]
pub struct PostgresDealStore {
    pool: PgPool,
}

impl PostgresDealStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn deal_from_row(row: &PgRow) -> Result<ProviderDeal> {
        let checkpoint: String = row.get("checkpoint");
        let retry: String = row.get("retry");
        let proposal: String = row.get("client_deal_proposal");
        let transfer: String = row.get("transfer");

        let placement = match (
            row.get::<Option<i64>, _>("slot_number"),
            row.get::<Option<i64>, _>("slot_offset"),
            row.get::<Option<i64>, _>("slot_length"),
        ) {
            (Some(slot), Some(offset), Some(length)) => Some(SlotPlacement {
                slot: slot as u64,
                offset: offset as u64,
                length: length as u64,
            }),
            _ => None,
        };

        Ok(ProviderDeal {
            deal_uuid: row.get("deal_uuid"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            signed_proposal_id: row.get("signed_proposal_id"),
            client_deal_proposal: serde_json::from_str(&proposal)?,
            client_peer_id: row.get("client_peer_id"),
            deal_data_root: row.get("deal_data_root"),
            transfer: serde_json::from_str(&transfer)?,
            inbound_file_path: row
                .get::<Option<String>, _>("inbound_file_path")
                .map(PathBuf::from),
            is_offline: row.get("is_offline"),
            checkpoint: Checkpoint::try_from(checkpoint.as_str()).map_err(ProvdError::Internal)?,
            checkpoint_at: row.get("checkpoint_at"),
            retry: RetryPolicy::try_from(retry.as_str()).map_err(ProvdError::Internal)?,
            err: row.get("error"),
            publish_cid: row.get("publish_cid"),
            chain_deal_id: row.get::<Option<i64>, _>("chain_deal_id").map(|id| id as u64),
            placement,
            cleanup_done: row.get("cleanup_done"),
        })
    }

    async fn fetch_many(&self, where_clause: &str) -> Result<Vec<ProviderDeal>> {
        let query = format!(
            "SELECT {} FROM provider_deals WHERE {} ORDER BY created_at",
            DEAL_COLUMNS, where_clause
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::deal_from_row).collect()
    }
}

#[async_trait]
impl DealStore for PostgresDealStore {
    /// Run migrations
    async fn init(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    #[instrument(skip(self, deal), fields(deal_uuid = %deal.deal_uuid))]
    async fn create(&self, deal: &ProviderDeal) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO provider_deals (
                deal_uuid, created_at, signed_proposal_id, client_deal_proposal, client_peer_id,
                deal_data_root, transfer, inbound_file_path, is_offline, checkpoint, checkpoint_at,
                retry, error, publish_cid, chain_deal_id, slot_number, slot_offset, slot_length,
                cleanup_done
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (deal_uuid) DO NOTHING
            "#,
        )
        .bind(deal.deal_uuid)
        .bind(deal.created_at)
        .bind(&deal.signed_proposal_id)
        .bind(serde_json::to_string(&deal.client_deal_proposal)?)
        .bind(&deal.client_peer_id)
        .bind(&deal.deal_data_root)
        .bind(serde_json::to_string(&deal.transfer)?)
        .bind(deal.inbound_file_path.as_ref().map(|p| p.display().to_string()))
        .bind(deal.is_offline)
        .bind(deal.checkpoint.as_str())
        .bind(deal.checkpoint_at)
        .bind(deal.retry.as_str())
        .bind(&deal.err)
        .bind(&deal.publish_cid)
        .bind(deal.chain_deal_id.map(|id| id as i64))
        .bind(deal.placement.map(|p| p.slot as i64))
        .bind(deal.placement.map(|p| p.offset as i64))
        .bind(deal.placement.map(|p| p.length as i64))
        .bind(deal.cleanup_done)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProvdError::DealAlreadyExists(deal.deal_uuid));
        }
        debug!("deal inserted");
        Ok(())
    }

    #[instrument(skip(self, deal), fields(deal_uuid = %deal.deal_uuid, checkpoint = %deal.checkpoint))]
    async fn update(&self, deal: &ProviderDeal) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE provider_deals SET
                inbound_file_path = $2,
                checkpoint = $3,
                checkpoint_at = $4,
                retry = $5,
                error = $6,
                publish_cid = $7,
                chain_deal_id = $8,
                slot_number = $9,
                slot_offset = $10,
                slot_length = $11,
                cleanup_done = $12
            WHERE deal_uuid = $1
            "#,
        )
        .bind(deal.deal_uuid)
        .bind(deal.inbound_file_path.as_ref().map(|p| p.display().to_string()))
        .bind(deal.checkpoint.as_str())
        .bind(deal.checkpoint_at)
        .bind(deal.retry.as_str())
        .bind(&deal.err)
        .bind(&deal.publish_cid)
        .bind(deal.chain_deal_id.map(|id| id as i64))
        .bind(deal.placement.map(|p| p.slot as i64))
        .bind(deal.placement.map(|p| p.offset as i64))
        .bind(deal.placement.map(|p| p.length as i64))
        .bind(deal.cleanup_done)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProvdError::DealNotFound(deal.deal_uuid));
        }
        Ok(())
    }

    async fn by_id(&self, deal_uuid: Uuid) -> Result<ProviderDeal> {
        let query = format!(
            "SELECT {} FROM provider_deals WHERE deal_uuid = $1",
            DEAL_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(deal_uuid)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::deal_from_row(&row),
            None => Err(ProvdError::DealNotFound(deal_uuid)),
        }
    }

    async fn by_signed_proposal(&self, proposal_id: &str) -> Result<ProviderDeal> {
        let query = format!(
            "SELECT {} FROM provider_deals WHERE signed_proposal_id = $1",
            DEAL_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(proposal_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::deal_from_row(&row),
            None => Err(ProvdError::DealNotFoundByProposal(proposal_id.to_string())),
        }
    }

    async fn list_active(&self) -> Result<Vec<ProviderDeal>> {
        self.fetch_many("checkpoint <> 'COMPLETE'").await
    }

    async fn list_completed(&self) -> Result<Vec<ProviderDeal>> {
        self.fetch_many("checkpoint = 'COMPLETE' AND NOT cleanup_done")
            .await
    }
}
