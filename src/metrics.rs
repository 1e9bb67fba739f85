use lazy_static::lazy_static;
use prometheus::{opts, register_int_counter_vec, register_int_gauge};
use prometheus::{IntCounterVec, IntGauge};

lazy_static! {
    pub static ref MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("murmux_messages_total", "number of messages"),
        &["protocol", "direction", "kind"]
    )
    .expect("can't create a metric");
    pub static ref MESSAGES_BYTES: IntCounterVec =
        register_int_counter_vec!(opts!("murmux_messages_bytes", "message bytes"), &["protocol", "direction", "kind"])
            .expect("can't create a metric");
    pub static ref CLIENTS_TOTAL: IntGauge =
        register_int_gauge!(opts!("murmux_clients_total", "Total number of clients")).expect("can't create a metric");
    pub static ref VOICE_FORWARDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("murmux_voice_forwards_total", "inter-edge voice datagrams"),
        &["direction"]
    )
    .expect("can't create a metric");
    pub static ref VOICE_DROPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("murmux_voice_drops_total", "voice frames dropped before delivery"),
        &["cause"]
    )
    .expect("can't create a metric");
    pub static ref RPC_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("murmux_rpc_requests_total", "hub rpc requests"),
        &["method", "outcome"]
    )
    .expect("can't create a metric");
}
