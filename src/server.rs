use std::path::Path;

use eyre::{eyre, Result, WrapErr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::control::{ControlRequest, HardwareRequest, HardwareResponse};

/// Largest partial request kept between reads.
const MAX_PENDING: usize = 64 * 1024;

/// Binds the control socket, replacing a stale socket file left by a
/// previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .wrap_err_with(|| format!("removing stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .wrap_err_with(|| format!("binding {}", path.display()))?;
    info!("Listening on {}", path.display());
    Ok(listener)
}

/// Accepts connections until the listener fails, one task per client.
pub async fn serve(listener: UnixListener, send_to_controller: mpsc::Sender<ControlRequest>) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let send_to_controller = send_to_controller.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(stream, send_to_controller).await {
                error!("Connection failed: {:#}", e);
            }
        });
    }
}

/// Reads a stream of JSON requests and answers each with one JSON response
/// followed by a newline.
pub async fn handle_stream(
    mut stream: UnixStream,
    send_to_controller: mpsc::Sender<ControlRequest>,
) -> Result<()> {
    info!("New connection: {:?}", stream);
    let mut msg = vec![0; 1024];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = stream.read(&mut msg).await?;
        if n == 0 {
            info!("Connection closed");
            break;
        }
        debug!("Read {} bytes", n);
        pending.extend_from_slice(&msg[..n]);

        let (batch, consumed, malformed) = decode(&pending);
        pending.drain(..consumed);

        for hw_req in batch {
            info!("Successfully received HardwareRequest message");
            debug!("Message: {:?}", hw_req);
            let response = handle_request(hw_req, &send_to_controller).await?;
            write_response(&mut stream, &response).await?;
        }
        if let Some(e) = malformed {
            warn!("Error decoding message: {}", e);
            write_response(&mut stream, &decode_error(e.to_string())).await?;
        }
        if pending.len() > MAX_PENDING {
            warn!("Dropping connection: {} bytes without a complete request", pending.len());
            write_response(&mut stream, &decode_error(format!("request exceeds {} bytes", MAX_PENDING))).await?;
            break;
        }
    }
    Ok(())
}

fn decode_error(message: String) -> HardwareResponse {
    HardwareResponse::Error {
        kind: "decode".to_string(),
        message,
    }
}

/// Splits complete requests off the front of `buf`. Returns the requests,
/// how many bytes they used, and a decode error if the input is garbage, in
/// which case everything buffered is consumed.
fn decode(buf: &[u8]) -> (Vec<HardwareRequest>, usize, Option<serde_json::Error>) {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<HardwareRequest>();
    let mut batch = Vec::new();
    loop {
        match stream.next() {
            Some(Ok(req)) => batch.push(req),
            // Partial value, wait for the rest.
            Some(Err(e)) if e.is_eof() => return (batch, stream.byte_offset(), None),
            Some(Err(e)) => return (batch, buf.len(), Some(e)),
            None => return (batch, buf.len(), None),
        }
    }
}

async fn handle_request(
    req: HardwareRequest,
    send_to_controller: &mpsc::Sender<ControlRequest>,
) -> Result<HardwareResponse> {
    let (recv_from_controller, control_req) = ControlRequest::from_hardware_request(req);
    send_to_controller
        .send(control_req)
        .await
        .map_err(|_| eyre!("controller is no longer running"))?;
    let response = recv_from_controller
        .await
        .wrap_err("controller dropped the request")?;
    debug!("Controller response: {:?}", response);
    Ok(response)
}

async fn write_response(stream: &mut UnixStream, response: &HardwareResponse) -> Result<()> {
    let mut encoded = serde_json::to_vec(response)?;
    encoded.push(b'\n');
    stream.write_all(&encoded).await?;
    Ok(())
}
