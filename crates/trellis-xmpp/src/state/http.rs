//! BOSH session start.
//!
//! The session-creation `<body/>` is presented to the machine as a stream
//! header. BOSH runs over HTTPS so there is no STARTTLS step, and no header
//! is written back: the session-creation response carries the features.

use async_trait::async_trait;

use super::common::{check_header, expect_header, features, mechanisms_feature};
use super::{State, StateId, Step};
use crate::parser::XmlEvent;
use crate::stream::Stream;
use crate::XmppError;

#[derive(Debug)]
pub struct Start {
    next: Option<StateId>,
}

impl Start {
    pub fn new(next: Option<StateId>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl State for Start {
    fn id(&self) -> StateId {
        StateId::Start
    }

    fn success(&self) -> Option<StateId> {
        self.next
    }

    async fn node(&mut self, stream: &mut Stream, event: XmlEvent) -> Result<Step, XmppError> {
        let header = expect_header(event)?;
        check_header(stream, &header)?;
        stream.open_stream(None, None);
        stream.write(&features(vec![mechanisms_feature(&["PLAIN"])]));
        Ok(Step::Advance)
    }
}
