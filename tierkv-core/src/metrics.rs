use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
};
use std::sync::OnceLock;

pub(crate) struct CoreMetrics {
    pub store_put_bytes: Counter<u64>,
    pub store_get_bytes: Counter<u64>,
    pub store_migrations: Counter<u64>,

    pub pager_spills: Counter<u64>,
    pub pager_page_ins: Counter<u64>,

    pub h2d_bytes: Counter<u64>,
    pub chunks_processed: Counter<u64>,
    pub forward_duration_seconds: Histogram<f64>,

    pub snapshot_rows: Counter<u64>,
    pub restored_rows: Counter<u64>,
}

fn init_meter() -> Meter {
    global::meter("tierkv-core")
}

pub(crate) fn core_metrics() -> &'static CoreMetrics {
    static METRICS: OnceLock<CoreMetrics> = OnceLock::new();
    METRICS.get_or_init(|| {
        let meter = init_meter();

        CoreMetrics {
            store_put_bytes: meter
                .u64_counter("tierkv_store_put_bytes_total")
                .with_unit("bytes")
                .with_description("Uncompressed bytes written to the block store")
                .build(),
            store_get_bytes: meter
                .u64_counter("tierkv_store_get_bytes_total")
                .with_unit("bytes")
                .with_description("Decompressed bytes served by the block store")
                .build(),
            store_migrations: meter
                .u64_counter("tierkv_store_migrations_total")
                .with_description("Blocks migrated from the local to the remote tier")
                .build(),

            pager_spills: meter
                .u64_counter("tierkv_pager_spills_total")
                .with_description("KV row pairs spilled from pinned arenas to disk")
                .build(),
            pager_page_ins: meter
                .u64_counter("tierkv_pager_page_ins_total")
                .with_description("KV row pairs paged back from disk into pinned arenas")
                .build(),

            h2d_bytes: meter
                .u64_counter("tierkv_h2d_bytes_total")
                .with_unit("bytes")
                .with_description("Bytes copied host to device by the attention pipeline")
                .build(),
            chunks_processed: meter
                .u64_counter("tierkv_chunks_processed_total")
                .with_description("KV chunks pushed through the copy/compute pipeline")
                .build(),
            forward_duration_seconds: meter
                .f64_histogram("tierkv_forward_duration_seconds")
                .with_unit("s")
                .with_description("Wall time of one paged attention forward")
                .build(),

            snapshot_rows: meter
                .u64_counter("tierkv_snapshot_rows_total")
                .with_description("KV rows snapshotted to the block store on eviction")
                .build(),
            restored_rows: meter
                .u64_counter("tierkv_restored_rows_total")
                .with_description("KV rows restored from the block store into cache cells")
                .build(),
        }
    })
}
