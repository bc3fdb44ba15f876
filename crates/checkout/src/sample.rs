//! 测试订单生成
//!
//! 供 `checkout-publisher` 在没有前端流量时向 channel 灌入订单，验证消费端链路。

use chrono::{SecondsFormat, Utc};
use order_proto::{Address, CartItem, Money, OrderItem, OrderResult};
use rand::Rng;
use rand::seq::index;
use serde_json::json;
use uuid::Uuid;

use crate::error::CheckoutError;

/// 商品目录：(商品 ID, 单价整数部分, 单价纳单位部分)
const CATALOG: &[(&str, i64, i32)] = &[
    ("OLJCESPC7Z", 101, 960_000_000),
    ("66VCHSJNUP", 349, 950_000_000),
    ("1YMWWN1N4O", 109, 990_000_000),
    ("L9ECAV7KIM", 89, 990_000_000),
    ("2ZYFJ3GM2N", 209, 950_000_000),
    ("0PUK6V6EV0", 129, 990_000_000),
    ("LS4PSXUNUM", 59, 990_000_000),
    ("9SIQT8TOJO", 3_599, 0),
    ("6E92ZMYYFZ", 8, 990_000_000),
];

const ADDRESSES: &[(&str, &str, &str, &str, &str)] = &[
    ("1600 Amphitheatre Parkway", "Mountain View", "CA", "United States", "94043"),
    ("One Microsoft Way", "Redmond", "WA", "United States", "98052"),
    ("410 Terry Ave N", "Seattle", "WA", "United States", "98109"),
];

/// 生成一个随机订单：1 到 3 种不同商品，每种 1 到 5 件
pub fn random_order() -> OrderResult {
    let mut rng = rand::rng();

    let item_count = rng.random_range(1..=3);
    let items = index::sample(&mut rng, CATALOG.len(), item_count)
        .into_iter()
        .map(|i| {
            let (product_id, units, nanos) = CATALOG[i];
            OrderItem {
                item: Some(CartItem {
                    product_id: product_id.to_string(),
                    quantity: rng.random_range(1..=5),
                }),
                cost: Some(Money::new("USD", units, nanos)),
            }
        })
        .collect();

    let (street, city, state, country, zip) = ADDRESSES[rng.random_range(0..ADDRESSES.len())];

    OrderResult {
        order_id: Uuid::new_v4().to_string(),
        shipping_tracking_id: Uuid::new_v4().to_string(),
        shipping_cost: Some(Money::new(
            "USD",
            rng.random_range(0..20),
            rng.random_range(0..1_000) * 1_000_000,
        )),
        shipping_address: Some(Address {
            street_address: street.to_string(),
            city: city.to_string(),
            state: state.to_string(),
            country: country.to_string(),
            zip_code: zip.to_string(),
        }),
        items,
    }
}

/// JSON 格式的连通性测试消息
///
/// 消费端会把它当作无法解码的负载记录后跳过，用于验证坏消息不会中断读取。
pub fn json_test_payload(order_id: &str) -> Result<Vec<u8>, CheckoutError> {
    let message = json!({
        "user_id": "test-user-12345",
        "order_id": order_id,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "amount": 99.99,
        "currency": "USD",
        "items": [
            {"product_id": "test-product", "quantity": 1, "price": 99.99}
        ]
    });
    Ok(serde_json::to_vec(&message)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_order_shape() {
        for _ in 0..20 {
            let order = random_order();
            assert!(!order.order_id.is_empty());
            assert!((1..=3).contains(&order.items.len()));
            assert!((1..=15).contains(&order.total_quantity()));
            assert!(order.shipping_address.is_some());

            let cost = order.shipping_cost.as_ref().unwrap();
            assert!((0..1_000_000_000).contains(&cost.nanos));
        }
    }

    #[test]
    fn test_random_order_has_distinct_products() {
        for _ in 0..20 {
            let order = random_order();
            let mut products: Vec<_> = order
                .items
                .iter()
                .map(|i| i.item.as_ref().unwrap().product_id.clone())
                .collect();
            products.sort();
            products.dedup();
            assert_eq!(products.len(), order.items.len());
        }
    }

    #[test]
    fn test_random_orders_are_unique() {
        assert_ne!(random_order().order_id, random_order().order_id);
    }

    #[test]
    fn test_json_payload() {
        let payload = json_test_payload("test-order-67890").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["order_id"], "test-order-67890");
        assert_eq!(value["items"][0]["quantity"], 1);
    }
}
