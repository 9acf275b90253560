use revenant_core::{Anchor, AnchorReceipt, AnchorSubmission, CoreError, CoreResult};

use crate::api_client::Timeouts;

/// Posts pre-signed submissions to a relay that pays gas and forwards them on chain.
#[derive(Debug, Clone)]
pub struct HttpAnchor {
    relay_url: String,
    agent: ureq::Agent,
}

impl HttpAnchor {
    #[must_use]
    pub fn new(relay_url: &str, timeouts: Timeouts) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeouts.connect)
            .timeout_read(timeouts.read)
            .build();
        Self { relay_url: relay_url.trim_end_matches('/').to_string(), agent }
    }
}

impl Anchor for HttpAnchor {
    fn submit(&self, submission: &AnchorSubmission) -> CoreResult<AnchorReceipt> {
        let url = format!("{}/{}", self.relay_url, submission.kind());
        self.agent
            .post(&url)
            .send_json(submission)
            .map_err(|err| CoreError::Anchor(err.to_string()))?
            .into_json::<AnchorReceipt>()
            .map_err(|err| CoreError::Anchor(format!("invalid relay response: {err}")))
    }
}
