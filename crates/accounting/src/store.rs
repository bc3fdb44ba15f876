//! 订单存储
//!
//! `PgOrderStore` 在一个事务内写入 order、orderitem、shipping 三张表；
//! 任何一条语句失败都会回滚整笔订单，并以 `Persist` 错误返回。

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, instrument};

use crate::error::AccountingError;
use crate::models::NormalizedOrder;

/// 订单持久化接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save(&self, order: &NormalizedOrder) -> Result<(), AccountingError>;
}

/// PostgreSQL 订单存储
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 执行内嵌的数据库迁移
    pub async fn migrate(&self) -> Result<(), AccountingError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("数据库迁移完成");
        Ok(())
    }

    async fn insert(&self, order: &NormalizedOrder) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(r#"INSERT INTO "order" (order_id) VALUES ($1)"#)
            .bind(&order.order.order_id)
            .execute(&mut *tx)
            .await?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO orderitem (
                    order_id, product_id, quantity,
                    item_cost_currency_code, item_cost_units, item_cost_nanos
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&item.order_id)
            .bind(&item.product_id)
            .bind(item.quantity)
            .bind(&item.item_cost_currency_code)
            .bind(item.item_cost_units)
            .bind(item.item_cost_nanos)
            .execute(&mut *tx)
            .await?;
        }

        let shipping = &order.shipping;
        sqlx::query(
            r#"
            INSERT INTO shipping (
                shipping_tracking_id, order_id,
                shipping_cost_currency_code, shipping_cost_units, shipping_cost_nanos,
                street_address, city, state, country, zip_code
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&shipping.shipping_tracking_id)
        .bind(&shipping.order_id)
        .bind(&shipping.shipping_cost_currency_code)
        .bind(shipping.shipping_cost_units)
        .bind(shipping.shipping_cost_nanos)
        .bind(&shipping.street_address)
        .bind(&shipping.city)
        .bind(&shipping.state)
        .bind(&shipping.country)
        .bind(&shipping.zip_code)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    #[instrument(skip_all, fields(order_id = %order.order_id()))]
    async fn save(&self, order: &NormalizedOrder) -> Result<(), AccountingError> {
        self.insert(order)
            .await
            .map_err(|e| AccountingError::Persist {
                order_id: order.order_id().to_string(),
                message: e.to_string(),
            })?;

        debug!(items = order.items.len(), "订单已写入数据库");
        Ok(())
    }
}
