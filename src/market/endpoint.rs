use crate::error::AppError;
use crate::market::types::{ControlAction, ControlFrame};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

const MAX_MESSAGE_SIZE: usize = 16 << 20;
const MAX_FRAME_SIZE: usize = 4 << 20;

pub type QuoteWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect_quote_stream(url: &str) -> Result<QuoteWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

pub fn control_message(action: ControlAction, symbols: &[String]) -> Result<Message, AppError> {
    let frame = ControlFrame {
        action,
        symbols: symbols.to_vec(),
    };
    Ok(Message::Text(frame.encode()?))
}
