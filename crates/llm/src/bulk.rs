//! Bulk Sync Executor: many independent calls through a bounded pool.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use batchloom_core::{LlmRequest, LlmResponse};

use crate::client::LlmClient;
use crate::error::LlmError;

/// Execute `requests` with at most `concurrency` calls in flight.
///
/// The returned list has the same length and order as `requests`. A failed
/// call becomes a failure response carrying the error text and the request
/// metadata; it never aborts the other calls. The only error returned is
/// [`LlmError::Cancelled`], when `cancel` fires before all work completed.
pub async fn execute_bulk_sync<C>(
    client: Arc<C>,
    requests: Vec<LlmRequest>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<LlmResponse>, LlmError>
where
    C: LlmClient + ?Sized + 'static,
{
    if cancel.is_cancelled() {
        return Err(LlmError::Cancelled);
    }

    let total = requests.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let workers = concurrency.max(1).min(total);
    debug!(total, workers, "bulk sync execution started");

    let (tx, rx) = mpsc::channel::<(usize, LlmRequest)>(total);
    for item in requests.into_iter().enumerate() {
        // capacity == total, so this never waits
        if tx.send(item).await.is_err() {
            break;
        }
    }
    drop(tx);

    let intake = Arc::new(Mutex::new(rx));
    let mut pool = JoinSet::new();

    for _ in 0..workers {
        let intake = Arc::clone(&intake);
        let client = Arc::clone(&client);
        let cancel = cancel.clone();

        pool.spawn(async move {
            let mut done = Vec::new();
            loop {
                let next = intake.lock().await.recv().await;
                let Some((index, request)) = next else { break };

                let response = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    response = call_one(&*client, &request, &cancel) => response,
                };
                done.push((index, response));
            }
            done
        });
    }

    let mut slots: Vec<Option<LlmResponse>> = vec![None; total];
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(done) => {
                for (index, response) in done {
                    slots[index] = Some(response);
                }
            }
            Err(err) => warn!(error = %err, "bulk worker task aborted"),
        }
    }

    if cancel.is_cancelled() {
        debug!(total, "bulk sync execution cancelled");
        return Err(LlmError::Cancelled);
    }

    let responses: Vec<LlmResponse> = slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| LlmResponse::failure("request was not executed")))
        .collect();
    let failed = responses.iter().filter(|r| !r.success).count();
    debug!(total, failed, "bulk sync execution finished");

    Ok(responses)
}

async fn call_one<C>(client: &C, request: &LlmRequest, cancel: &CancellationToken) -> LlmResponse
where
    C: LlmClient + ?Sized,
{
    match client.complete(request, cancel).await {
        Ok(mut response) => {
            if response.metadata.is_empty() {
                response.metadata = request.metadata.clone();
            }
            response
        }
        Err(err) => {
            debug!(error = %err, "request failed");
            LlmResponse::failure(err.to_string()).with_metadata(request.metadata.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use proptest::prelude::*;

    use crate::mock::MockLlmClient;

    fn requests(n: usize) -> Vec<LlmRequest> {
        (0..n)
            .map(|i| LlmRequest::new("sys", format!("prompt {i}")).with_metadata("index", i as u64))
            .collect()
    }

    #[tokio::test]
    async fn preserves_order_with_mixed_failures() {
        let client = Arc::new(MockLlmClient::new().failing_on("prompt 1"));
        let mut reqs = requests(4);
        reqs[1].user_prompt = "prompt 1 (bad)".to_string();

        let out = execute_bulk_sync(client, reqs, 3, &CancellationToken::new()).await.unwrap();

        assert_eq!(out.len(), 4);
        assert!(out[0].success);
        assert_eq!(out[0].content, "response to: prompt 0");
        assert!(!out[1].success);
        assert!(out[1].content.is_empty());
        assert!(out[1].error_message().contains("400"));
        assert_eq!(out[1].metadata.get("index"), Some(&serde_json::Value::from(1u64)));
        assert!(out[2].success);
        assert_eq!(out[3].content, "response to: prompt 3");
    }

    #[tokio::test]
    async fn zero_concurrency_runs_one_at_a_time() {
        let client = Arc::new(MockLlmClient::new().with_delay(Duration::from_millis(2)));

        let out = execute_bulk_sync(client.clone(), requests(5), 0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.len(), 5);
        assert_eq!(client.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn empty_input_returns_empty_output() {
        let client = Arc::new(MockLlmClient::new());
        let out = execute_bulk_sync(client.clone(), Vec::new(), 4, &CancellationToken::new())
            .await
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_returns_promptly() {
        let client = Arc::new(MockLlmClient::new().with_delay(Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            execute_bulk_sync(client, requests(10), 2, &cancel),
        )
        .await
        .expect("executor must not hang after cancellation");

        assert!(matches!(result, Err(LlmError::Cancelled)));
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_calls() {
        let client = Arc::new(MockLlmClient::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = execute_bulk_sync(client.clone(), requests(3), 2, &cancel).await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(client.calls(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn never_exceeds_concurrency_limit(n in 0usize..24, limit in 0usize..8) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let client = Arc::new(MockLlmClient::new().with_delay(Duration::from_millis(1)));
            let out = rt
                .block_on(execute_bulk_sync(client.clone(), requests(n), limit, &CancellationToken::new()))
                .unwrap();

            prop_assert_eq!(out.len(), n);
            prop_assert!(client.max_in_flight() <= limit.max(1));
            prop_assert_eq!(client.calls() as usize, n);
            for (i, response) in out.iter().enumerate() {
                prop_assert_eq!(&response.content, &format!("response to: prompt {i}"));
            }
        }
    }
}
