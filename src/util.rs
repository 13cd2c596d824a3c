use std::any::Any;
use std::future::Future;

use sentry_core::protocol::SpanStatus;

/// Run `future` inside a Sentry transaction named after the job type.
pub(crate) async fn with_sentry_transaction<F, R, E>(transaction_name: &str, future: F) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "queue.task");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = future.await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Best-effort message extraction from a panic payload.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> String {
    if let Some(x) = info.downcast_ref::<&'static str>() {
        (*x).to_string()
    } else if let Some(x) = info.downcast_ref::<String>() {
        x.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
