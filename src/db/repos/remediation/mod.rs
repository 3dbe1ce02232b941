pub mod breakers;
pub mod heal_log;
pub mod incidents;
pub mod schema_heal;
