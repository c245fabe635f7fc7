use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use super::framing::{self, Frame, FrameDecoder};
use super::{ChannelOps, LinkState, Packet, StreamConfig};

const READ_CHUNK: usize = 16 * 1024;

struct StreamReader {
    io: Box<dyn AsyncRead + Send + Unpin>,
    decoder: FrameDecoder,
}

/// A framed byte stream. Reads happen in whoever polls the transport;
/// writes are queued to a dedicated task so `send` never blocks.
pub(super) struct StreamChannel {
    reader: Mutex<StreamReader>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    max_packet: usize,
    sndbuf: i32,
}

impl StreamChannel {
    pub(super) fn new<R, W>(
        reader: R,
        writer: W,
        link: Arc<LinkState>,
        config: &StreamConfig,
        sndbuf: i32,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx, link));
        Self {
            reader: Mutex::new(StreamReader {
                io: Box::new(reader),
                decoder: FrameDecoder::new(config.max_packet),
            }),
            writer: tx,
            max_packet: config.max_packet,
            sndbuf,
        }
    }

    fn enqueue(&self, link: &LinkState, frame: Vec<u8>) -> io::Result<()> {
        if self.writer.send(frame).is_err() {
            link.fail();
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream writer has exited"));
        }
        Ok(())
    }

    pub(super) fn send_break(&self, link: &LinkState) -> io::Result<()> {
        let frame = framing::encode_break().to_vec();
        link.account(0, frame.len());
        self.enqueue(link, frame)
    }
}

#[async_trait]
impl ChannelOps for StreamChannel {
    fn send(&self, link: &LinkState, bufs: &[&[u8]], _dest: Option<SocketAddr>) -> io::Result<()> {
        let frame = match framing::encode_frame(bufs, self.max_packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("stream send: {e}");
                link.fail();
                return Err(e);
            }
        };
        link.account(frame.len() - framing::HEADER_LEN, frame.len());
        self.enqueue(link, frame)
    }

    async fn recv(&self) -> io::Result<Option<Packet>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.decoder.next_frame()? {
                Some(Frame::Packet(data)) => return Ok(Some(Packet { data, source: None })),
                Some(Frame::Break) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected break frame on stream",
                    ));
                }
                None => {}
            }
            let mut chunk = [0_u8; READ_CHUNK];
            let n = reader.io.read(&mut chunk).await?;
            if n == 0 {
                if reader.decoder.buffered() > 0 {
                    debug!("EOF inside a frame, {} bytes discarded", reader.decoder.buffered());
                }
                return Ok(None);
            }
            trace!("read {} bytes", n);
            reader.decoder.extend(&chunk[..n]);
        }
    }

    fn send_buffer_size(&self) -> i32 {
        self.sndbuf
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, link: Arc<LinkState>)
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = link.failed() => break,
        };
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!("stream write failed: {e}");
            link.fail();
            break;
        }
    }
    let _ = writer.shutdown().await;
}
