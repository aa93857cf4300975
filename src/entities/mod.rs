pub mod customer;
pub mod customer_price;
pub mod daily_inventory_snapshot;
pub mod inventory_movement;
pub mod order;
pub mod order_item;
pub mod product;
pub mod sequence_counter;
