//! The protocol front-end's request loop (component C2): handshake on
//! start, one task per `get`/`put` so slow artifact I/O on one request
//! never blocks another, a single writer task so responses never
//! interleave on stdout, and `close` draining in-flight handlers before
//! finalizing the cache exactly once, however many times it's asked.

use crate::cache::combined::{CacheError, CombinedCache, GetOutcome};
use crate::model::{ActionId, OutputId};
use crate::protocol::frame::FrameReader;
use crate::protocol::types::Response;
use crate::util::pool::BoundedPool;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Drives the protocol over `stdin`/`stdout` until the input stream ends,
/// then returns. A `close` request finalizes the cache but does not end
/// the loop by itself: a toolchain that sends a further request (or a
/// second `close`) after its first `close` still gets an answer, so
/// `close` is idempotent rather than a hard stop (spec §8 scenario 5).
/// `stdin`/`stdout` are generic so tests can drive the loop over
/// in-memory buffers.
///
/// Returns `Ok(true)` once the close handler (run exactly once, whether
/// triggered by an explicit `close` or by EOF — spec §4.2) completed
/// without error, `Ok(false)` if it reported an error (spec §7: "a
/// remote finalisation error is surfaced so CI pipelines can notice a
/// broken cache"), so the caller can choose the process exit code (spec
/// §8 scenario 6).
pub async fn run<R, W>(stdin: R, stdout: W, cache: Arc<CombinedCache>) -> std::io::Result<bool>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Response>(BoundedPool::default_response_channel_capacity());

    let writer_task = tokio::spawn(async move {
        let mut writer = BufWriter::new(stdout);
        while let Some(response) = rx.recv().await {
            write_response(&mut writer, &response).await?;
        }
        writer.flush().await
    });

    tx.send(Response::handshake())
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "response writer task exited early"))?;

    let pool = BoundedPool::new(BoundedPool::default_dispatch_capacity());
    let mut reader = FrameReader::new(stdin);
    let mut handlers: JoinSet<()> = JoinSet::new();
    let mut close_succeeded = None;

    loop {
        let Some((request, body)) = reader.next_request().await? else {
            break;
        };

        match request.command.as_str() {
            "get" => {
                let cache = cache.clone();
                let tx = tx.clone();
                let pool = pool.clone();
                handlers.spawn(async move {
                    let _permit = pool.acquire().await;
                    let response = handle_get(&cache, &request.action_id, request.id).await;
                    let _ = tx.send(response).await;
                });
            }
            "put" => {
                // A malformed body (bad base64, wrong declared length) is a
                // fatal error for this one request only (spec §4.1); it
                // never reaches the handler or touches the cache.
                match body {
                    Some(Err(e)) => {
                        let _ = tx.send(Response::error(request.id, e.to_string())).await;
                    }
                    body => {
                        let body = body.map(|b| b.expect("Err case handled above"));
                        let cache = cache.clone();
                        let tx = tx.clone();
                        let pool = pool.clone();
                        handlers.spawn(async move {
                            let _permit = pool.acquire().await;
                            let response = handle_put(&cache, &request, body, request.id).await;
                            let _ = tx.send(response).await;
                        });
                    }
                }
            }
            "close" => {
                // Idempotent (spec §4.2, §8 scenario 5): a repeated close
                // acks cheaply without re-running the handler, so either
                // two CLOSEs or a CLOSE followed by EOF both finalize
                // exactly once.
                while handlers.join_next().await.is_some() {}
                let response = match close_succeeded {
                    Some(_) => Response::close_ack(request.id),
                    None => {
                        let (response, succeeded) = handle_close(&cache, request.id).await;
                        close_succeeded = Some(succeeded);
                        response
                    }
                };
                let _ = tx.send(response).await;
            }
            other => {
                let _ = tx
                    .send(Response::error(request.id, format!("unsupported command {other:?}")))
                    .await;
            }
        }
    }

    while handlers.join_next().await.is_some() {}

    // EOF without an explicit `close` still finalizes the cache exactly
    // once (spec §4.2): there is no originating request to answer, so
    // only the handler's success is observed.
    let close_succeeded = match close_succeeded {
        Some(succeeded) => succeeded,
        None => handle_close(&cache, 0).await.1,
    };

    drop(tx);
    writer_task
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
    Ok(close_succeeded)
}

async fn handle_get(cache: &CombinedCache, action_id: &Option<String>, id: u64) -> Response {
    let Some(action_id) = action_id else {
        return Response::error(id, "get request missing ActionID");
    };
    match cache.get(&ActionId(action_id.clone())).await {
        GetOutcome::Hit {
            output_id,
            disk_path,
            size,
            time_nanos,
        } => Response::hit(id, &output_id.0, size, time_nanos, disk_path.display().to_string()),
        GetOutcome::Miss => Response::miss(id),
    }
}

async fn handle_put(
    cache: &CombinedCache,
    request: &crate::protocol::types::Request,
    body: Option<crate::util::clonable::ClonableBytes>,
    id: u64,
) -> Response {
    let (Some(action_id), Some(output_id)) = (&request.action_id, &request.output_id) else {
        return Response::error(id, "put request missing ActionID or OutputID");
    };
    let size = request.body_size.max(0) as u64;
    let reader_result = match body {
        Some(bytes) => {
            cache
                .put(ActionId(action_id.clone()), OutputId(output_id.clone()), size, bytes.view())
                .await
        }
        None => {
            cache
                .put(
                    ActionId(action_id.clone()),
                    OutputId(output_id.clone()),
                    0,
                    std::io::Cursor::new(Vec::new()),
                )
                .await
        }
    };
    match reader_result {
        Ok(_) => Response::put_ack(id),
        Err(CacheError::Local(e)) => Response::error(id, e.to_string()),
        Err(e) => Response::error(id, e.to_string()),
    }
}

async fn handle_close(cache: &CombinedCache, id: u64) -> (Response, bool) {
    match cache.close().await {
        Ok(()) => (Response::close_ack(id), true),
        Err(e) => (Response::error(id, e.to_string()), false),
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
