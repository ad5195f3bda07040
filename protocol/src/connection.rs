//! 连接封装
//!
//! 提供 [`ChatMessage`] 的收发接口，封装传输层和编解码。

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::Result;
use crate::message::ChatMessage;
use crate::transport::Transport;

/// 连接封装
pub struct Connection<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Connection<R, W> {
    /// 从传输层创建连接
    pub fn new<T: Transport<Reader = R, Writer = W>>(transport: T) -> Self {
        let (reader, writer) = transport.split();
        Self::from_parts(reader, writer)
    }

    /// 从读写端直接创建连接
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    /// 分离为读取端和写入端，用于需要并发读写的场景
    pub fn split(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }

    pub async fn recv(&mut self) -> Result<ChatMessage> {
        self.reader.read_frame().await
    }

    pub async fn send(&mut self, msg: &ChatMessage) -> Result<()> {
        self.writer.write_frame(msg).await
    }

    /// 关闭写方向
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, TcpListener, TcpTransport, TransportConfig, TransportListener};

    #[tokio::test]
    async fn test_connection_send_recv() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_handle = tokio::spawn(async move {
            let transport = TcpTransport::connect(&addr.to_string(), &TransportConfig::default())
                .await
                .unwrap();
            let mut conn = Connection::new(transport);

            conn.send(&ChatMessage::connect("alice")).await.unwrap();

            let reply = conn.recv().await.unwrap();
            assert_eq!(reply.action, Action::Connect);
            assert_eq!(reply.body, "ok");
        });

        let transport = listener.accept().await.unwrap();
        let mut conn = Connection::new(transport);

        let mut msg = conn.recv().await.unwrap();
        assert_eq!(msg, ChatMessage::connect("alice"));

        msg.body = "ok".to_string();
        conn.send(&msg).await.unwrap();

        client_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_gives_peer_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_handle = tokio::spawn(async move {
            let transport = TcpTransport::connect(&addr.to_string(), &TransportConfig::default())
                .await
                .unwrap();
            let mut conn = Connection::new(transport);
            conn.close().await.unwrap();
            // 保持读端存活直到服务端读完
            let _ = conn.recv().await;
        });

        let mut conn = Connection::new(listener.accept().await.unwrap());
        let err = conn.recv().await.unwrap_err();
        assert!(err.is_closed());

        drop(conn);
        client_handle.await.unwrap();
    }
}
