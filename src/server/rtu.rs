// SPDX-FileCopyrightText: Copyright (c) 2017-2023 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU server

use std::{fmt, future::Future, io, sync::Arc};

use bytes::Bytes;
use futures_util::StreamExt as _;
use log::{debug, error, info, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_serial::SerialStream;
use tokio_util::codec::FramedRead;

use crate::{
    codec::{self, encode_exception, encode_response},
    config::SerialConfig,
    frame::{rtu::RequestAdu, ExceptionCode, SlaveRequest},
    server::service::{Service, StoreService},
    store::RegisterStore,
};

/// Capacity of the queue between the frame readers and the dispatcher.
pub const REQUEST_QUEUE_LEN: usize = 16;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// A decoded request together with the connection that must receive the reply.
struct InboundRequest {
    adu: RequestAdu,
    conn: SharedWriter,
}

impl fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundRequest")
            .field("adu", &self.adu)
            .finish_non_exhaustive()
    }
}

/// Modbus RTU server.
///
/// Requests read from any served transport are queued to a single dispatch
/// task, so the service is never invoked concurrently.
#[derive(Debug)]
pub struct Server {
    requests: mpsc::Sender<InboundRequest>,
    dispatcher: JoinHandle<()>,
}

impl Server {
    /// Spawns the dispatch task for `service`.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<S>(service: S) -> Self
    where
        S: Service<Request = SlaveRequest, Response = Bytes, Exception = ExceptionCode>
            + Send
            + Sync
            + 'static,
    {
        let (requests, queue) = mpsc::channel(REQUEST_QUEUE_LEN);
        let dispatcher = tokio::spawn(dispatch(queue, service));
        Self {
            requests,
            dispatcher,
        }
    }

    /// A server answering from the register store.
    pub fn with_store(store: Arc<RegisterStore>) -> Self {
        Self::new(StoreService::new(store))
    }

    /// Serve requests arriving on `transport` until the stream ends.
    ///
    /// Read errors such as parity or framing faults are logged and the
    /// partial frame is dropped. Only a closed transport ends serving early.
    pub async fn serve<T>(&self, transport: T) -> io::Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let conn: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let mut frames = FramedRead::new(reader, codec::rtu::ServerCodec);

        while let Some(adu) = frames.next().await {
            let adu = match adu {
                Ok(adu) => adu,
                Err(err) if is_closed(&err) => return Err(err),
                Err(err) => {
                    // The framed reader stops after an error, resume with an empty buffer.
                    warn!("Read failed: {err}");
                    frames = FramedRead::new(frames.into_inner(), codec::rtu::ServerCodec);
                    continue;
                }
            };
            trace!("RX: {adu:?}");
            let request = InboundRequest {
                adu,
                conn: Arc::clone(&conn),
            };
            if self.requests.send(request).await.is_err() {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "request dispatcher has stopped",
                ));
            }
        }
        info!("Exiting listen loop");
        Ok(())
    }

    /// Serve requests on `transport` until the stream ends or a shutdown signal is received.
    pub async fn serve_until<T, Sd>(&self, transport: T, shutdown_signal: Sd) -> io::Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        Sd: Future<Output = ()>,
    {
        tokio::select! {
            res = self.serve(transport) => res,
            () = shutdown_signal => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }

    /// Stops accepting requests and waits until the queued ones are answered.
    pub async fn shutdown(self) {
        let Self {
            requests,
            dispatcher,
        } = self;
        drop(requests);
        if let Err(err) = dispatcher.await {
            error!("Request dispatcher failed: {err}");
        }
    }
}

/// Errors after which no further bytes can arrive on the transport.
fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Opens the serial port on which upstream masters query the gateway.
pub fn open(config: &SerialConfig) -> io::Result<SerialStream> {
    let serial = SerialStream::open(&config.builder())?;
    Ok(serial)
}

async fn dispatch<S>(mut queue: mpsc::Receiver<InboundRequest>, service: S)
where
    S: Service<Request = SlaveRequest, Response = Bytes, Exception = ExceptionCode>,
{
    while let Some(InboundRequest { adu, conn }) = queue.recv().await {
        let address: u8 = adu.hdr.slave.into();
        let function = adu.pdu.function_code();
        let frame = match service.call(adu.into()).await {
            Ok(payload) => encode_response(address, function, &payload),
            Err(exception) => {
                debug!("Device 0x{address:02X}, function {function}: {exception}");
                encode_exception(address, function, exception)
            }
        };
        trace!("TX: {frame:02X?}");

        let mut writer = conn.lock().await;
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            error!("Unable to send reply: {err}");
            break;
        }
    }
    debug!("Request dispatcher finished");
}
