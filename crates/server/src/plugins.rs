use protocol::{Request, Response, Update};

/// Scripts the device's answers for [`crate::DeviceServer::serve`].
pub trait ServerPlugin: Send + Sync {
    /// The response to `request`, or `None` to leave it to the next plugin.
    fn provide_response(&self, _request: &Request) -> Option<Response> {
        None
    }

    /// Updates to push once the response to `request` has been sent.
    fn updates_after(&self, _request: &Request) -> Vec<Update> {
        Vec::new()
    }
}
