// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};
use sockline::{
    setup_local_tracing, Augmentation, ClientId, ConnectionOptions, Endpoint, MessageChannel,
    MultiClientServer, Posture, ServerMessageChannel, TcpClient, TextEncoding,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[fixture]
#[once]
fn setup() {
    let _ = setup_local_tracing();
}

async fn relay_server() -> (Arc<MultiClientServer>, Arc<ServerMessageChannel>) {
    let server = Arc::new(MultiClientServer::new(
        Endpoint::new("127.0.0.1", 0).unwrap(),
        ConnectionOptions::multi_client(),
        Posture::Strict,
    ));
    let channel = ServerMessageChannel::attach(&server);
    let (tx, mut relay) = mpsc::unbounded_channel::<(ClientId, String)>();
    channel.subscribe_message(move |id, message| {
        let _ = tx.send((id.clone(), message.to_string()));
        Ok(())
    });
    server.start().await.unwrap();

    let relay_channel = channel.clone();
    tokio::spawn(async move {
        while let Some((sender, message)) = relay.recv().await {
            let _ = relay_channel.broadcast(&message, Some(&sender)).await;
        }
    });
    (server, channel)
}

async fn chat_client(
    server: &MultiClientServer,
) -> (TcpClient, Arc<MessageChannel>, mpsc::UnboundedReceiver<String>) {
    let port = server.local_addr().unwrap().port();
    let client = TcpClient::new(
        Endpoint::new("127.0.0.1", port).unwrap(),
        ConnectionOptions::single_client(),
        Posture::Strict,
    );
    client.start().await.unwrap();
    let channel = MessageChannel::attach(client.connection());
    let (tx, rx) = mpsc::unbounded_channel();
    channel.subscribe_message(move |message| {
        let _ = tx.send(message.to_string());
        Ok(())
    });
    (client, channel, rx)
}

async fn wait_for_clients(server: &MultiClientServer, count: usize) {
    timeout(WAIT, async {
        while server.list_clients().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[rstest]
#[tokio::test]
async fn test_relay_between_clients(_setup: ()) {
    let (server, _channel) = relay_server().await;
    let (alice, alice_channel, mut alice_inbox) = chat_client(&server).await;
    let (bob, _bob_channel, mut bob_inbox) = chat_client(&server).await;
    wait_for_clients(&server, 2).await;

    alice_channel.send_message("hello").await.unwrap();
    alice_channel.send_message("").await.unwrap();
    alice_channel.send_message("héllo wörld").await.unwrap();

    assert_eq!(timeout(WAIT, bob_inbox.recv()).await.unwrap().unwrap(), "hello");
    assert_eq!(timeout(WAIT, bob_inbox.recv()).await.unwrap().unwrap(), "");
    assert_eq!(
        timeout(WAIT, bob_inbox.recv()).await.unwrap().unwrap(),
        "héllo wörld"
    );
    assert!(alice_inbox.try_recv().is_err());

    alice.graceful_stop().await;
    bob.graceful_stop().await;
    server.graceful_stop().await;
}

#[rstest]
#[tokio::test]
async fn test_server_message_to_one_client(_setup: ()) {
    let (server, channel) = relay_server().await;
    let (client, _client_channel, mut inbox) = chat_client(&server).await;
    wait_for_clients(&server, 1).await;

    let id = server.list_clients().pop().unwrap();
    channel.send_message(&id, "direct").await.unwrap();
    assert_eq!(timeout(WAIT, inbox.recv()).await.unwrap().unwrap(), "direct");

    client.force_stop().await;
    server.force_stop().await;
}

struct Shout;

impl Augmentation for Shout {
    fn before_send_line(&self, line: String, _encoding: TextEncoding) -> String {
        line.to_uppercase()
    }
}

#[rstest]
#[tokio::test]
async fn test_lines_pass_through_augmentations(_setup: ()) {
    let server = Arc::new(MultiClientServer::new(
        Endpoint::new("127.0.0.1", 0).unwrap(),
        ConnectionOptions::multi_client().with_line_terminator("\r\n"),
        Posture::Strict,
    ));
    let (tx, mut lines) = mpsc::unbounded_channel();
    server.subscribe_line(move |id, line| {
        let _ = tx.send((id.clone(), line.to_string()));
        Ok(())
    });
    let port = server.start().await.unwrap().port();

    let client = TcpClient::new(
        Endpoint::new("127.0.0.1", port).unwrap(),
        ConnectionOptions::single_client().with_line_terminator("\r\n"),
        Posture::Strict,
    );
    client.start().await.unwrap();
    client.install_augmentation(Arc::new(Shout));
    client.connection().write_line("quiet please").await.unwrap();

    let (id, line) = timeout(WAIT, lines.recv()).await.unwrap().unwrap();
    assert_eq!(line, "QUIET PLEASE");
    assert!(server.list_clients().contains(&id));

    server.write_line(&id, "ok").await.unwrap();
    assert_eq!(client.connection().read_line().await.unwrap(), "ok");

    client.graceful_stop().await;
    server.graceful_stop().await;
}
