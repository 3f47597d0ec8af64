//! Loading a page and its linked style sheets into a [`PageContext`].

use scraper::Html;
use std::sync::Arc;
use std::time::Duration;

use offgrid_core::{Error, EventKind, EventSink, NormalizePolicy, ResourceRef};

use super::{PageContext, document_base, stylesheet_hrefs};
use crate::fetch::{Network, ResourceRequest, fetch_with_timeout};

/// Fetches pages for discovery.
pub struct PageLoader {
    network: Arc<dyn Network>,
    timeout: Duration,
    policy: NormalizePolicy,
    events: Arc<dyn EventSink>,
}

impl PageLoader {
    pub fn new(
        network: Arc<dyn Network>, timeout: Duration, policy: NormalizePolicy, events: Arc<dyn EventSink>,
    ) -> Self {
        Self { network, timeout, policy, events }
    }

    /// Fetch `page` as a navigation, then each linked style sheet.
    ///
    /// A failed or non-success page load is an error. Style sheets that cannot
    /// be fetched are skipped; the page is still usable without them.
    pub async fn load(&self, page: &ResourceRef) -> Result<PageContext, Error> {
        let request = ResourceRequest::navigate(page.url().clone());
        let response = fetch_with_timeout(self.network.as_ref(), &request, self.timeout).await?;
        if !response.status.is_success() {
            return Err(Error::HttpStatus(format!("{page}: page returned HTTP {}", response.status.as_u16())));
        }

        let html = String::from_utf8_lossy(&response.bytes).into_owned();
        let mut context = PageContext::new(response.final_url.clone(), html);

        let sheets: Vec<ResourceRef> = {
            let doc = Html::parse_document(&context.html);
            let base = document_base(&doc, &context.url);
            stylesheet_hrefs(&doc)
                .iter()
                .filter_map(|href| ResourceRef::resolve(&base, href, self.policy).ok())
                .collect()
        };

        for sheet in sheets {
            let request = ResourceRequest::get(sheet.url().clone());
            match fetch_with_timeout(self.network.as_ref(), &request, self.timeout).await {
                Ok(resp) if resp.status.is_success() => {
                    let css = String::from_utf8_lossy(&resp.bytes).into_owned();
                    context.stylesheets.push((sheet, css));
                }
                Ok(resp) => self.events.on_event(
                    EventKind::NetworkFailed,
                    &format!("stylesheet {sheet}: HTTP {}", resp.status.as_u16()),
                ),
                Err(e) => self
                    .events
                    .on_event(EventKind::NetworkFailed, &format!("stylesheet {sheet}: {e}")),
            }
        }

        Ok(context)
    }
}
