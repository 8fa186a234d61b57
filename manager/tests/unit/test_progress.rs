//! Progress registry tests

use std::sync::{Arc, Mutex};

use webmgr::progress::{Progress, ProgressSink, TaskState};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for Recorder {
    fn started(&self, key: &str, description: &str, total: usize) {
        self.events.lock().unwrap().push(format!("start {key} {description} /{total}"));
    }

    fn advanced(&self, key: &str, position: usize, total: usize, description: Option<&str>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{key} {position}/{total} {}", description.unwrap_or("-")));
    }

    fn finished(&self, key: &str, state: TaskState, message: Option<&str>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{key} {state} {}", message.unwrap_or("")));
    }
}

#[test]
fn test_events_reach_the_sink_in_order() {
    let recorder = Arc::new(Recorder::default());
    let progress = Progress::new(recorder.clone());

    let task = progress.begin("shop.test", "Add shop.test", 2).unwrap();
    task.update(0, Some("Fetching source"));
    task.update(1, None);
    task.update(5, Some("Finalizing"));
    task.complete(Some("done"));

    assert_eq!(
        recorder.events(),
        vec![
            "start shop.test Add shop.test /2",
            "shop.test 0/2 Fetching source",
            "shop.test 1/2 -",
            "shop.test 2/2 Finalizing",
            "shop.test completed done",
        ]
    );
}

#[test]
fn test_failed_task_releases_key() {
    let progress = Progress::default();
    let task = progress.begin("shop.test", "Update shop.test", 10).unwrap();
    assert!(progress.has_active_task());
    assert_eq!(progress.state("shop.test"), TaskState::Running);

    task.fail("build failed");
    assert!(!progress.has_active_task());
    assert_eq!(progress.state("shop.test"), TaskState::Failed);
    assert!(progress.position("shop.test").is_none());

    // The key can be reused once released
    progress.begin("shop.test", "Update shop.test", 10).unwrap().complete(None);
    assert_eq!(progress.cleanup_count(), 2);
    assert_eq!(progress.state("shop.test"), TaskState::Completed);
}
