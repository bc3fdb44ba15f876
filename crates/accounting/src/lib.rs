//! 记账服务
//!
//! 以 `accounting` 消费组读取订单事件，记录订单信息；
//! 配置了数据库时把订单拆分为 order / orderitem / shipping 三张表的行并在一个事务内写入。
//! 写入失败只记录日志，不中断读取。

pub mod error;
pub mod handler;
pub mod models;
pub mod store;
