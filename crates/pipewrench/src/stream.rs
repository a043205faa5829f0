//! Stream read loop: chunked reads from the input, tokenizer events
//! dispatched to the interceptor, zero-length read finalizes the stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::channel::SpawnError;
use crate::intercept::Interceptor;
use crate::parser::{ParseError, Tokenizer};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("filter process did not finish before the drain deadline")]
    DrainTimeout,
}

/// Pumps `input` through the tokenizer and interceptor until end of stream,
/// then finishes the interceptor (final flush, filter process reaped). On
/// failure the filter process is torn down before the error propagates.
pub async fn run_pipeline<R, W>(
    input: &mut R,
    interceptor: &mut Interceptor<W>,
) -> Result<(), PipelineError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tokenizer = Tokenizer::new();
    match pump(input, &mut tokenizer, interceptor).await {
        Ok(()) => interceptor.finish().await,
        Err(e) => {
            interceptor.abort().await;
            Err(e)
        }
    }
}

async fn pump<R, W>(
    input: &mut R,
    tokenizer: &mut Tokenizer,
    interceptor: &mut Interceptor<W>,
) -> Result<(), PipelineError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let n = input.read(&mut buf).await?;
        tracing::trace!(bytes = n, "Read input chunk");
        if n == 0 {
            let (_, events) = tokenizer.advance(&[])?;
            for event in events {
                interceptor.handle(event).await?;
            }
            return Ok(());
        }

        // The tokenizer stops at message boundaries, so one chunk may take
        // several calls to consume.
        let mut cursor = 0;
        while cursor < n {
            let (consumed, events) = tokenizer.advance(&buf[cursor..n])?;
            for event in events {
                interceptor.handle(event).await?;
            }
            if consumed == 0 {
                break;
            }
            cursor += consumed;
        }
    }
}
