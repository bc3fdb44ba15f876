//! 订单事件 Protobuf 消息定义
//!
//! checkout 发布、fraud-detection / accounting 消费的订单记录。
//! 字段编号与上游 `oteldemo.OrderResult` 保持一致，生产者与消费者共享同一份二进制契约。
//! 使用 prost derive 直接声明消息结构，无需构建期代码生成。

use prost::Message;

/// 金额：整数部分 + 纳单位小数部分
#[derive(Clone, PartialEq, Message)]
pub struct Money {
    /// ISO 4217 货币代码
    #[prost(string, tag = "1")]
    pub currency_code: String,
    #[prost(int64, tag = "2")]
    pub units: i64,
    /// 取值范围 [-999_999_999, 999_999_999]，符号与 units 一致
    #[prost(int32, tag = "3")]
    pub nanos: i32,
}

impl Money {
    pub fn new(currency_code: impl Into<String>, units: i64, nanos: i32) -> Self {
        Self {
            currency_code: currency_code.into(),
            units,
            nanos,
        }
    }

    /// 格式化为十进制字符串，例如 `12.500000000`
    pub fn to_decimal_string(&self) -> String {
        let negative = self.units < 0 || self.nanos < 0;
        let sign = if negative { "-" } else { "" };
        format!(
            "{sign}{}.{:09}",
            self.units.unsigned_abs(),
            self.nanos.unsigned_abs()
        )
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Address {
    #[prost(string, tag = "1")]
    pub street_address: String,
    #[prost(string, tag = "2")]
    pub city: String,
    #[prost(string, tag = "3")]
    pub state: String,
    #[prost(string, tag = "4")]
    pub country: String,
    #[prost(string, tag = "5")]
    pub zip_code: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct CartItem {
    #[prost(string, tag = "1")]
    pub product_id: String,
    #[prost(int32, tag = "2")]
    pub quantity: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct OrderItem {
    #[prost(message, optional, tag = "1")]
    pub item: Option<CartItem>,
    #[prost(message, optional, tag = "2")]
    pub cost: Option<Money>,
}

/// 下单完成后由 checkout 发布的订单结果
#[derive(Clone, PartialEq, Message)]
pub struct OrderResult {
    #[prost(string, tag = "1")]
    pub order_id: String,
    #[prost(string, tag = "2")]
    pub shipping_tracking_id: String,
    #[prost(message, optional, tag = "3")]
    pub shipping_cost: Option<Money>,
    #[prost(message, optional, tag = "4")]
    pub shipping_address: Option<Address>,
    #[prost(message, repeated, tag = "5")]
    pub items: Vec<OrderItem>,
}

impl OrderResult {
    /// 编码为 protobuf 二进制
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// 从 protobuf 二进制解码
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }

    /// 订单中所有商品的件数之和
    pub fn total_quantity(&self) -> i64 {
        self.items
            .iter()
            .filter_map(|i| i.item.as_ref())
            .map(|i| i64::from(i.quantity))
            .sum()
    }
}
