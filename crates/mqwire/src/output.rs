use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use mqwire_client::{Delivery, Tuning};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct DeliveryOutput<'a> {
    consumer_tag: &'a str,
    delivery_tag: u64,
    redelivered: bool,
    exchange: &'a str,
    routing_key: &'a str,
    content_type: Option<&'a str>,
    body_size: usize,
    body: String,
    timestamp: String,
}

pub fn print_delivery(delivery: &Delivery, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = DeliveryOutput {
                consumer_tag: &delivery.consumer_tag,
                delivery_tag: delivery.envelope.delivery_tag,
                redelivered: delivery.envelope.redelivered,
                exchange: &delivery.envelope.exchange,
                routing_key: &delivery.envelope.routing_key,
                content_type: delivery.properties.content_type.as_deref(),
                body_size: delivery.body.len(),
                body: payload_preview(&delivery.body),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["TAG", "EXCHANGE", "KEY", "SIZE", "BODY"])
                .add_row(vec![
                    delivery.envelope.delivery_tag.to_string(),
                    delivery.envelope.exchange.clone(),
                    delivery.envelope.routing_key.clone(),
                    delivery.body.len().to_string(),
                    payload_preview(&delivery.body),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "tag={} exchange={} key={} redelivered={} size={} body={}",
                delivery.envelope.delivery_tag,
                delivery.envelope.exchange,
                delivery.envelope.routing_key,
                delivery.envelope.redelivered,
                delivery.body.len(),
                payload_preview(&delivery.body)
            );
        }
        OutputFormat::Raw => {
            print_raw(&delivery.body);
        }
    }
}

#[derive(Serialize)]
struct InfoOutput<'a> {
    addr: &'a str,
    state: String,
    channel_max: u16,
    frame_max: u32,
    heartbeat: u16,
}

pub fn print_info(addr: &str, state: &str, tuning: Tuning, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = InfoOutput {
                addr,
                state: state.to_string(),
                channel_max: tuning.channel_max,
                frame_max: tuning.frame_max,
                heartbeat: tuning.heartbeat,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ADDR", "STATE", "CHANNEL MAX", "FRAME MAX", "HEARTBEAT"])
                .add_row(vec![
                    addr.to_string(),
                    state.to_string(),
                    tuning.channel_max.to_string(),
                    tuning.frame_max.to_string(),
                    format!("{}s", tuning.heartbeat),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!(
                "addr={addr} state={state} channel_max={} frame_max={} heartbeat={}s",
                tuning.channel_max, tuning.frame_max, tuning.heartbeat
            );
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.write_all(b"\n");
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
