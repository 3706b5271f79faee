//! Ramping HTTP load against a local server, with the control API on
//! `127.0.0.1:6565`.
//!
//! ```sh
//! cargo run --example http -- http://localhost:3000
//! curl -X PATCH localhost:6565/v1/status -d '{"paused": true}'
//! ```
use std::{
    process::ExitCode,
    sync::Arc,
    time::Instant,
};

use reqwest::Client;
use stampede::{
    ActionVuFactory, IterationContext, IterationError, Registry, Reporter, StdoutReporter,
    TestOptions, TestRun,
    classify::{ExpectedStatuses, HttpExchange, ResponseClassifier, emit_http_response},
    logging,
};
use tokio_util::sync::CancellationToken;

const OPTIONS: &str = r#"{
    "scenarios": {
        "ramp": {
            "executor": "ramping-vus",
            "stages": [
                { "duration": "3s", "target": 10 },
                { "duration": "3s", "target": 100 },
                { "duration": "3s", "target": 10 }
            ]
        }
    },
    "thresholds": {
        "http_req_failed": [{ "threshold": "rate<0.01", "abortOnFail": true }],
        "http_req_duration{expected_response:true}": ["p(95)<200"]
    }
}"#;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:3000".to_string());

    let options = match TestOptions::from_json(OPTIONS) {
        Ok(options) => options,
        Err(err) => {
            tracing::error!(%err, "bad options");
            return ExitCode::from(104);
        }
    };

    // one client for every VU, connections are pooled
    let client = Client::new();
    let classifier: Arc<dyn ResponseClassifier> = Arc::new(ExpectedStatuses::default());
    let factory = ActionVuFactory::new(move |ctx: IterationContext| {
        let client = client.clone();
        let classifier = Arc::clone(&classifier);
        let target = target.clone();
        async move {
            let start = Instant::now();
            let response = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(IterationError::Interrupted),
                res = client.get(&target).send() => res,
            };
            let status = match response {
                Ok(r) => r.status().as_u16(),
                Err(err) => return Err(IterationError::Failed(err.to_string())),
            };
            let exchange = HttpExchange {
                status,
                duration: start.elapsed(),
                bytes_sent: 0,
                bytes_received: 0,
            };
            let samples = emit_http_response(&ctx.builtins, &ctx.tags, &exchange, Some(&classifier));
            ctx.emit(samples)
                .await
                .map_err(|e| IterationError::Failed(e.to_string()))
        }
    });

    let run = match TestRun::new(options, Arc::new(Registry::new()), Arc::new(factory)) {
        Ok(run) => run,
        Err(err) => {
            tracing::error!(%err, "invalid test");
            return ExitCode::from(104);
        }
    };

    let shutdown = CancellationToken::new();
    let api = tokio::spawn(stampede::api::serve(
        run.control_surface(),
        ([127, 0, 0, 1], 6565).into(),
        shutdown.clone(),
    ));
    let stopper = {
        let control = run.control_surface();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                control.request_stop(true);
                // a second ctrl-c interrupts in-flight iterations
                if tokio::signal::ctrl_c().await.is_ok() {
                    control.request_stop(false);
                }
            }
        })
    };

    let outcome = run.run().await;
    stopper.abort();
    shutdown.cancel();
    if let Ok(Err(err)) = api.await {
        tracing::warn!(%err, "control API failed");
    }

    if let Err(err) = StdoutReporter.report(&outcome.summary).await {
        tracing::error!(%err, "could not print the summary");
    }
    outcome.exit_code().into()
}
