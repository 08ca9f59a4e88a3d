//! Streaming stdout of an in-flight command.
//!
//! For long-running programs, `OutputStream` hands out stdout as it arrives
//! instead of accumulating the whole response. The stream ends at the first
//! sentinel; [`into_response`](OutputStream::into_response) then reads stderr.

use bytes::{Bytes, BytesMut};
use log::debug;

use super::engine::{Section, Session, bounded};
use super::response::Response;
use crate::error::{ByteStr, ProtocolError, Result};
use crate::protocol::SENTINEL;
use crate::transport::Channel;

/// Stdout kept for reporting a timeout.
const TAIL_LEN: usize = 256;

/// Real-time handle on a submitted command's stdout.
///
/// Created by [`Session::follow_stream`].
///
/// # Example
///
/// ```rust,no_run
/// # use mpwire::{Repl, Session};
/// # async fn example(session: &mut Session<Box<dyn mpwire::Channel>>) -> Result<(), mpwire::Error> {
/// session.submit_no_follow(b"for i in range(100): print(i)").await?;
/// let mut stream = session.follow_stream()?;
/// while let Some(chunk) = stream.next_chunk().await? {
///     print!("{}", String::from_utf8_lossy(&chunk));
/// }
/// let response = stream.into_response().await?;
/// assert!(response.is_success());
/// # Ok(())
/// # }
/// ```
pub struct OutputStream<'a, C: Channel> {
    session: &'a mut Session<C>,
    finished: bool,
    /// Last bytes handed out, shown if the first sentinel never arrives.
    tail: BytesMut,
}

impl<'a, C: Channel> OutputStream<'a, C> {
    pub(super) fn new(session: &'a mut Session<C>) -> Self {
        Self {
            session,
            finished: false,
            tail: BytesMut::new(),
        }
    }

    /// Next piece of stdout, or `None` once the first sentinel arrived.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.session.stdout_done {
            return Ok(None);
        }
        let result = bounded(self.session.deadline, self.read_chunk()).await;
        match &result {
            Ok(Some(chunk)) => self.remember(chunk),
            Ok(None) => {}
            Err(e) => {
                self.session.note_failure(e);
                self.finished = true;
            }
        }
        result
    }

    fn remember(&mut self, chunk: &[u8]) {
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > TAIL_LEN {
            let excess = self.tail.len() - TAIL_LEN;
            let _ = self.tail.split_to(excess);
        }
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let timeout = self.session.config.timeout;
        loop {
            if let Some(mut data) = self.session.buffer.take_through(&[SENTINEL]) {
                data.truncate(data.len() - 1);
                self.session.stdout_done = true;
                return Ok((!data.is_empty()).then_some(data));
            }
            if !self.session.buffer.is_empty() {
                return Ok(Some(self.session.buffer.take_all()));
            }
            if !self.session.fill(Some(timeout)).await? {
                return Err(ProtocolError::FirstEofTimeout {
                    observed: ByteStr::from(Bytes::copy_from_slice(&self.tail)),
                }
                .into());
            }
        }
    }

    /// Read any remaining stdout and the stderr section.
    ///
    /// The returned [`Response`] holds only stdout not already yielded by
    /// [`next_chunk`](Self::next_chunk).
    pub async fn into_response(mut self) -> Result<Response> {
        let mut rest = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            rest.extend_from_slice(&chunk);
        }

        let result = bounded(self.session.deadline, self.session.read_section(Section::Stderr)).await;
        self.finished = true;
        match result {
            Ok(stderr) => {
                let elapsed = self.session.finish_command();
                Ok(Response::new(rest.freeze(), stderr, elapsed))
            }
            Err(e) => {
                self.session.note_failure(&e);
                Err(e)
            }
        }
    }
}

impl<C: Channel> Drop for OutputStream<'_, C> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "{}: output stream dropped early; collect() reads the rest",
                self.session.name()
            );
        }
    }
}
