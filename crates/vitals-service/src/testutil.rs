//! Test doubles shared by the worker tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use vitals_client::{Page, Result, TimeseriesApi};
use vitals_types::Sample;

/// One recorded `fetch_page` invocation.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub site: String,
    pub start: String,
    pub end: String,
    pub cursor: Option<String>,
}

/// A [`TimeseriesApi`] that replays a scripted sequence of responses and
/// records every call. Once the script runs dry it returns empty pages.
pub(crate) struct ScriptedApi {
    responses: Mutex<VecDeque<Result<Page>>>,
    calls: Mutex<Vec<RecordedCall>>,
    sites: Vec<String>,
}

impl ScriptedApi {
    pub fn new(responses: Vec<Result<Page>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            sites: Vec::new(),
        }
    }

    pub fn with_sites(mut self, sites: &[&str]) -> Self {
        self.sites = sites.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn page(samples: Vec<Sample>, next_cursor: Option<&str>) -> Page {
        Page {
            samples,
            next_cursor: next_cursor.map(|c| c.to_string()),
            skipped: 0,
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("poisoned").len()
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl TimeseriesApi for ScriptedApi {
    async fn fetch_page(
        &self,
        site: &str,
        start: &str,
        end: &str,
        cursor: Option<&str>,
        _point_names: &[String],
    ) -> Result<Page> {
        self.calls.lock().expect("poisoned").push(RecordedCall {
            site: site.to_string(),
            start: start.to_string(),
            end: end.to_string(),
            cursor: cursor.map(|c| c.to_string()),
        });

        match self.responses.lock().expect("poisoned").pop_front() {
            Some(response) => response,
            None => Ok(Page {
                samples: Vec::new(),
                next_cursor: None,
                skipped: 0,
            }),
        }
    }

    async fn list_sites(&self) -> Result<Vec<String>> {
        Ok(self.sites.clone())
    }
}
