use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridlink_core::{
    config::DataSourceConfig,
    data_source::{DataRequest, DataSource, DataSourceBackend},
    error::{Error, ErrorType},
    results::{ActionExtension, ActionKind, DataAction, DataResult},
    serializer::SerializerState,
    task::{while_task, CancellationToken, PollOutcome, PollPolicy},
};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
struct Grid {
    id: String,
    produced_by: &'static str,
    rows: Vec<i64>,
}

impl DataResult for Grid {
    fn unique_result_id(&self) -> &str {
        &self.id
    }
}

/// Backend logging the start and end of each remote call.
#[derive(Default)]
struct Backend {
    log: Mutex<Vec<String>>,
    requests: AtomicUsize,
}

#[async_trait]
impl DataSourceBackend<String, Grid> for Backend {
    async fn request(&self, request: DataRequest<String, Grid>) -> Result<Option<Vec<Grid>>, Error> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push("request:start".to_owned());
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.log.lock().push("request:end".to_owned());
        Ok(Some(vec![Grid {
            id: "grid".to_owned(),
            produced_by: "request",
            rows: (0..request.count as i64).collect(),
        }]))
    }

    async fn save(&self, mut results: Vec<Grid>) -> Result<Vec<Grid>, Error> {
        self.log.lock().push("save:start".to_owned());
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.log.lock().push("save:end".to_owned());
        for result in results.iter_mut() {
            result.produced_by = "save";
        }
        Ok(results)
    }

    async fn load_total_count(&self, _: Grid, _: CancellationToken) -> Result<u64, Error> {
        Err(Error::not_supported("Total count".to_owned()))
    }
}

struct Selection;

impl ActionExtension<Grid> for Selection {
    fn kind(&self) -> ActionKind {
        Self::KIND
    }
}

impl DataAction<Grid> for Selection {
    const KIND: ActionKind = ActionKind("select");
    fn create(_: &Grid) -> Self {
        Selection
    }
}

fn setup() -> (DataSource<String, Grid>, Arc<Backend>) {
    let backend = Arc::new(Backend::default());
    let config = DataSourceConfig {
        fetch_size: 3,
        ..Default::default()
    };
    let source = DataSource::new(backend.clone(), &config);
    source.register_action::<Selection>();
    (source, backend)
}

#[tokio::test(start_paused = true)]
async fn test_request_waits_for_inflight_save() -> Result<(), Box<dyn std::error::Error>> {
    let (source, backend) = setup();
    source.request_data().await?;

    let saving = {
        let source = source.clone();
        tokio::spawn(async move { source.save_data().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.state(), SerializerState::Saving);

    source.request_data().await?;
    saving.await??;

    assert_eq!(
        *backend.log.lock(),
        vec![
            "request:start",
            "request:end",
            "save:start",
            "save:end",
            "request:start",
            "request:end"
        ]
    );
    let results = source.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].produced_by, "request");
    assert_eq!(results[0].rows, vec![0, 1, 2]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_issue_one_call() -> Result<(), Box<dyn std::error::Error>> {
    let (source, backend) = setup();
    let (a, b) = tokio::join!(source.request_data(), source.request_data());
    a?;
    b?;
    assert_eq!(backend.requests.load(Ordering::SeqCst), 1);
    assert!(source.is_loadable());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_polling_task() -> Result<(), Box<dyn std::error::Error>> {
    let (source, _) = setup();
    let polls = Arc::new(AtomicUsize::new(0));
    let running = {
        let source = source.clone();
        let polls = polls.clone();
        tokio::spawn(async move {
            source
                .run_cancellable_task(move |token| async move {
                    while_task(
                        &token,
                        &PollPolicy::new(Duration::from_millis(200)),
                        |_: &()| PollOutcome::Pending,
                        || {
                            polls.fetch_add(1, Ordering::SeqCst);
                            async { Ok(()) }
                        },
                    )
                    .await
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(source.is_loading());
    assert!(source.can_cancel());
    assert!(source.cancel());

    let e = running.await?.unwrap_err();
    assert_eq!(e.error_type, ErrorType::Cancelled);
    let seen = polls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(polls.load(Ordering::SeqCst), seen);
    assert!(!source.is_loading());
    Ok(())
}

#[tokio::test]
async fn test_plain_task_cannot_be_cancelled() -> Result<(), Box<dyn std::error::Error>> {
    let (source, _) = setup();
    let value = source
        .run_task(|| async { Ok::<_, Error>("done") })
        .await?;
    assert_eq!(value, "done");
    assert!(!source.cancel());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_action_index_out_of_range() -> Result<(), Box<dyn std::error::Error>> {
    let (source, _) = setup();
    source.request_data().await?;

    let e = match source.get_action::<Selection>(1usize) {
        Ok(_) => panic!("index 1 must be out of range"),
        Err(e) => e,
    };
    assert_eq!(e.error_type, ErrorType::IndexOutOfRange);
    assert!(source.try_get_action::<Selection>(1usize).is_none());

    source.get_action::<Selection>(0usize)?;
    assert!(source.try_get_action::<Selection>(0usize).is_some());
    Ok(())
}

#[tokio::test]
async fn test_request_failure_reaches_caller_only() -> Result<(), Box<dyn std::error::Error>> {
    struct Failing;

    #[async_trait]
    impl DataSourceBackend<String, Grid> for Failing {
        async fn request(&self, _: DataRequest<String, Grid>) -> Result<Option<Vec<Grid>>, Error> {
            Err(Error::remote_call_error("readDataFromContainer", "timeout"))
        }
        async fn save(&self, results: Vec<Grid>) -> Result<Vec<Grid>, Error> {
            Ok(results)
        }
        async fn load_total_count(&self, _: Grid, _: CancellationToken) -> Result<u64, Error> {
            Ok(0)
        }
    }

    let source: DataSource<String, Grid> = DataSource::new(Arc::new(Failing), &DataSourceConfig::default());
    let e = source.request_data().await.unwrap_err();
    assert_eq!(e.error_type, ErrorType::RemoteCallError);
    assert!(source.error().is_none());
    assert!(!source.is_loading());
    source.save_data().await?;
    Ok(())
}
