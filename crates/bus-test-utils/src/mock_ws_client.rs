//! A thin raw WebSocket client speaking the `{"account", "data"}` frame
//! envelope directly, for tests that poke at a broker (or peer) without
//! pulling in the full `services/peer` runtime.

use bus_codec::Key;
use bus_protocol::{Frame, FrameData, Packet, ServerId};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(frame)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send a `Packet` in the clear, addressed from account `"-----"` —
    /// the only form the broker accepts outside an established key.
    pub async fn send_plain(
        &mut self,
        account: ServerId,
        packet: Packet,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_frame(&Frame::plain(account, packet)).await
    }

    /// Encrypt `packet` under `key` and send it as account `account`.
    pub async fn send_encrypted(
        &mut self,
        account: ServerId,
        key: &Key,
        packet: &Packet,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let plaintext = serde_json::to_vec(packet)?;
        let ciphertext = key.encrypt(&plaintext);
        self.send_frame(&Frame::ciphertext(account, ciphertext)).await
    }

    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(serde_json::from_str(&text)?);
                }
                Some(Ok(Message::Ping(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    return Err("connection closed".into());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Box::new(e)),
            }
        }
    }

    /// Receive a frame and decrypt it with `key`, returning the inner packet.
    pub async fn recv_decrypted(&mut self, key: &Key) -> Result<Packet, Box<dyn std::error::Error>> {
        let frame = self.recv_frame().await?;
        match frame.data {
            FrameData::Ciphertext(ciphertext) => {
                let plaintext = key.decrypt(&ciphertext)?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
            FrameData::Plain(packet) => Ok(*packet),
        }
    }
}
