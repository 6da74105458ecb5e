pub mod order;
pub mod order_item;
pub mod payment_queue;
pub mod wallet;
pub mod wallet_deposit;
pub mod wallet_history;
pub mod wallet_hold;
pub mod warehouse_item;
pub mod withdraw_request;
