//! Async utilities around Tokio runtime.


/// Build the multi-thread Tokio runtime with time and I/O enabled, used to
/// back the download workers for the duration of one batch.
pub fn runtime() -> tokio::runtime::Runtime {

    tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .enable_io()
        .build()
        .unwrap()

}
