//! 订单落库行模型
//!
//! 一个 `OrderResult` 拆分为一行 order、每个商品一行 orderitem 和一行 shipping。
//! 金额按 (币种, 整数部分, 纳单位) 三列存储，缺失的字段写入零值。

use order_proto::{Money, OrderResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRow {
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItemRow {
    pub order_id: String,
    pub product_id: String,
    pub quantity: i32,
    pub item_cost_currency_code: String,
    pub item_cost_units: i64,
    pub item_cost_nanos: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShippingRow {
    pub shipping_tracking_id: String,
    pub order_id: String,
    pub shipping_cost_currency_code: String,
    pub shipping_cost_units: i64,
    pub shipping_cost_nanos: i32,
    pub street_address: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub zip_code: String,
}

/// 一笔订单对应的全部行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedOrder {
    pub order: OrderRow,
    pub items: Vec<OrderItemRow>,
    pub shipping: ShippingRow,
}

impl NormalizedOrder {
    pub fn order_id(&self) -> &str {
        &self.order.order_id
    }
}

/// 将订单拆分为落库行
pub fn normalize(order: &OrderResult) -> NormalizedOrder {
    let items = order
        .items
        .iter()
        .map(|item| {
            let cart = item.item.clone().unwrap_or_default();
            let cost = item.cost.clone().unwrap_or_default();
            OrderItemRow {
                order_id: order.order_id.clone(),
                product_id: cart.product_id,
                quantity: cart.quantity,
                item_cost_currency_code: cost.currency_code,
                item_cost_units: cost.units,
                item_cost_nanos: cost.nanos,
            }
        })
        .collect();

    let cost = order.shipping_cost.clone().unwrap_or_default();
    let address = order.shipping_address.clone().unwrap_or_default();

    NormalizedOrder {
        order: OrderRow {
            order_id: order.order_id.clone(),
        },
        items,
        shipping: ShippingRow {
            shipping_tracking_id: order.shipping_tracking_id.clone(),
            order_id: order.order_id.clone(),
            shipping_cost_currency_code: cost.currency_code,
            shipping_cost_units: cost.units,
            shipping_cost_nanos: cost.nanos,
            street_address: address.street_address,
            city: address.city,
            state: address.state,
            country: address.country,
            zip_code: address.zip_code,
        },
    }
}

/// 日志中展示的运费，例如 `8.990000000 USD`
pub fn display_cost(cost: Option<&Money>) -> String {
    match cost {
        Some(money) => format!("{} {}", money.to_decimal_string(), money.currency_code),
        None => "-".to_string(),
    }
}
