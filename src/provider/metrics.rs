use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Result};

lazy_static! {
    /*
     * Finality
     */
    pub static ref HEAD_EPOCH: Result<IntGaugeVec> = try_create_int_gauge_vec(
        "harbor_head_epoch",
        "Epoch of the latest majority-agreed finalized checkpoint",
        &["namespace"]
    );
    pub static ref SERVING_EPOCH: Result<IntGaugeVec> = try_create_int_gauge_vec(
        "harbor_serving_epoch",
        "Epoch of the checkpoint bundle currently being served",
        &["namespace"]
    );

    /*
     * Stores
     */
    pub static ref BLOCK_CACHE_LEN: Result<IntGaugeVec> = try_create_int_gauge_vec(
        "harbor_block_cache_len",
        "Count of blocks held in the block store",
        &["namespace"]
    );
    pub static ref STATE_CACHE_LEN: Result<IntGaugeVec> = try_create_int_gauge_vec(
        "harbor_state_cache_len",
        "Count of beacon states held in the state store",
        &["namespace"]
    );

    /*
     * Upstreams and downloads
     */
    pub static ref UPSTREAM_ERRORS: Result<IntCounterVec> = try_create_int_counter_vec(
        "harbor_upstream_errors",
        "The number of failed requests for each upstream node",
        &["namespace", "node"]
    );
    pub static ref BUNDLE_DOWNLOADS: Result<IntCounterVec> = try_create_int_counter_vec(
        "harbor_bundle_downloads",
        "Bundle download tasks by outcome",
        &["namespace", "outcome"]
    );
}

pub fn try_create_int_gauge_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntGaugeVec> {
    let gauge_vec = IntGaugeVec::new(Opts::new(name, help), label_names)?;
    prometheus::register(Box::new(gauge_vec.clone()))?;
    Ok(gauge_vec)
}

pub fn try_create_int_counter_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntCounterVec> {
    let counter_vec = IntCounterVec::new(Opts::new(name, help), label_names)?;
    prometheus::register(Box::new(counter_vec.clone()))?;
    Ok(counter_vec)
}

pub fn set_gauge_vec(gauge_vec: &Result<IntGaugeVec>, labels: &[&str], value: i64) {
    if let Ok(gauge_vec) = gauge_vec {
        gauge_vec.with_label_values(labels).set(value);
    }
}

pub fn inc_counter_vec(counter_vec: &Result<IntCounterVec>, labels: &[&str]) {
    if let Ok(counter_vec) = counter_vec {
        counter_vec.with_label_values(labels).inc();
    }
}
