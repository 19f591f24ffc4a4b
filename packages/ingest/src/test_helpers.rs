//! Scripted page source for engine tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bronze_fetch::{FetchRequest, PageSource};
use bronze_ingest_models::{DatasetSpec, FetchOutcome, PageResult};
use tokio_util::sync::CancellationToken;

/// Serves a fixed number of records per page and records every page it
/// was asked for.
///
/// Pages without a script are empty. [`Self::fail_once`] queues outcomes
/// that are served before the scripted page.
#[derive(Default)]
pub struct ScriptedSource {
    pages: Mutex<BTreeMap<u32, usize>>,
    overrides: Mutex<BTreeMap<u32, VecDeque<FetchOutcome>>>,
    fetched: Mutex<Vec<u32>>,
    cancel_at: Mutex<Option<(u32, CancellationToken)>>,
}

impl ScriptedSource {
    /// Pages `1..=sizes.len()` with the given record counts.
    pub fn with_pages(sizes: &[usize]) -> Self {
        let source = Self::default();
        source.set_pages(sizes);
        source
    }

    /// `last_page` full pages of `page_size` records.
    pub fn with_boundary(last_page: u32, page_size: usize) -> Self {
        let sizes = vec![page_size; last_page as usize];
        Self::with_pages(&sizes)
    }

    /// Replaces the page script.
    pub fn set_pages(&self, sizes: &[usize]) {
        let mut pages = self.pages.lock().unwrap();
        pages.clear();
        for (i, size) in sizes.iter().enumerate() {
            pages.insert(u32::try_from(i).unwrap() + 1, *size);
        }
    }

    /// Serves `outcome` for every request of `page` until cleared.
    pub fn always(&self, page: u32, outcome: FetchOutcome) {
        self.overrides
            .lock()
            .unwrap()
            .insert(page, VecDeque::from(vec![outcome; 10_000]));
    }

    /// Serves `outcome` the next time `page` is requested.
    pub fn fail_once(&self, page: u32, outcome: FetchOutcome) {
        self.overrides
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .push_back(outcome);
    }

    /// Cancels `token` while page `page` is in flight, as an interrupt
    /// arriving mid-request would.
    pub fn cancel_at(&self, page: u32, token: CancellationToken) {
        *self.cancel_at.lock().unwrap() = Some((page, token));
    }

    /// Removes every queued override.
    pub fn clear_overrides(&self) {
        self.overrides.lock().unwrap().clear();
    }

    /// Every page index requested so far, in order.
    pub fn fetched(&self) -> Vec<u32> {
        self.fetched.lock().unwrap().clone()
    }

    /// Forgets the request history.
    pub fn reset_fetched(&self) {
        self.fetched.lock().unwrap().clear();
    }

    /// The records page `page` serves.
    pub fn records(page: u32, count: usize) -> Vec<serde_json::Value> {
        (0..count)
            .map(|i| serde_json::json!({"page": page, "row": i}))
            .collect()
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch(&self, request: &FetchRequest<'_>) -> FetchOutcome {
        let page = request.page_index;
        self.fetched.lock().unwrap().push(page);

        if let Some((at, token)) = self.cancel_at.lock().unwrap().as_ref()
            && *at == page
        {
            token.cancel();
            return FetchOutcome::Cancelled;
        }

        if let Some(outcome) = self
            .overrides
            .lock()
            .unwrap()
            .get_mut(&page)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }

        match self.pages.lock().unwrap().get(&page) {
            Some(&count) if count > 0 => FetchOutcome::Success(PageResult {
                page_index: page,
                records: Self::records(page, count),
            }),
            _ => FetchOutcome::EmptyTerminator,
        }
    }
}

/// A paginated dataset for tests.
pub fn paginated_spec(id: &str, max_pages: u32) -> DatasetSpec {
    DatasetSpec {
        id: id.to_string(),
        url: format!("https://api.example.com/{id}"),
        params: BTreeMap::from([("codigoOrgao".to_string(), "26000".to_string())]),
        page_param: "pagina".to_string(),
        page_size_param: None,
        page_size: 100,
        max_pages,
        storage_key: format!("bronze/transparency/{id}.json"),
        requires_pagination: true,
        records_path: None,
        fast_skip_if_exists: false,
    }
}

/// A non-paginated dataset for tests.
pub fn single_spec(id: &str) -> DatasetSpec {
    DatasetSpec {
        requires_pagination: false,
        ..paginated_spec(id, 1)
    }
}

/// A transient failure that exhausted retries.
pub fn exhausted() -> FetchOutcome {
    FetchOutcome::TransientError {
        cause: "HTTP 503".to_string(),
        attempts: 5,
    }
}
