use std::fmt::Write;

use crate::types::{ScannedNetwork, StatusSnapshot};

/// Connectivity-check URLs probed by phones and laptops. Answering them with
/// the setup page makes the OS pop up the captive portal.
pub const CAPTIVE_PROBE_PATHS: &[&str] = &[
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

const RESET_HTML: &str = r#"<!doctype html>
<html lang="en"><head><meta charset="utf-8"><title>Reset</title></head>
<body><h1>Configuration cleared</h1><p>The device is restarting into setup mode.</p></body></html>
"#;

const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Environment Monitor Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:8px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}input,select{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Environment Monitor Setup</h1>
  <p class="muted">Pick a network or type its name, then save. The device restarts and joins it.</p>
  <form class="card" method="post" action="/configure">
    <label>Network</label>
    <select name="ssid"><option value="">(choose)</option>{{options}}</select>
    <label>Or enter SSID manually</label><input name="ssid_manual" type="text">
    <label>Username (WPA2-Enterprise only)</label><input name="username" type="text">
    <label>Password</label><input name="password" type="password">
    <details>
      <summary>Broker settings</summary>
      <label>Edge ID</label><input name="edgeId" type="text">
      <label>MQTT Host</label><input name="mqttHost" type="text">
      <label>MQTT Port</label><input name="mqttPort" type="number" min="1" max="65535" placeholder="1883">
      <label>MQTT Username</label><input name="mqttUser" type="text">
      <label>MQTT Password</label><input name="mqttPassword" type="password">
    </details>
    <button type="submit">Save and restart</button>
  </form>
  <form method="post" action="/reset"><button type="submit">Factory reset</button></form>
</body>
</html>
"#;

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn reset_page() -> &'static str {
    RESET_HTML
}

/// Setup page with one `<option>` per scanned network, in scan order.
pub fn portal_page(networks: &[ScannedNetwork]) -> String {
    let mut options = String::new();
    for network in networks {
        let ssid = escape_html(&network.ssid);
        let lock = if network.is_enterprise {
            " [802.1X]"
        } else if network.is_open {
            ""
        } else {
            " [secured]"
        };
        let _ = write!(
            options,
            r#"<option value="{ssid}">{ssid} ({} dBm){lock}</option>"#,
            network.rssi_dbm
        );
    }
    PORTAL_HTML.replace("{{options}}", &options)
}

pub fn submitted_page(ssid: &str) -> String {
    format!(
        "<!doctype html><html><body><h1>Saved</h1><p>Joining <b>{}</b>. The device is restarting.</p></body></html>",
        escape_html(ssid)
    )
}

pub fn status_page(status: &StatusSnapshot) -> String {
    let mut rows = String::new();
    let mut row = |label: &str, value: String| {
        let _ = write!(
            rows,
            "<tr><th>{label}</th><td>{}</td></tr>",
            escape_html(&value)
        );
    };

    row("MAC", status.mac_address.clone());
    row("Uptime", format!("{} s", status.uptime_secs));
    row("WiFi", status.link.as_str().to_string());
    row("SSID", status.target_ssid.clone());
    row(
        "Address",
        status
            .local_address
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
    if let Some(ap) = &status.ap_ssid {
        row("Access point", ap.clone());
    }
    row("MQTT", status.broker.as_str().to_string());
    row(
        "Broker",
        format!("{}:{}", status.broker_host, status.broker_port),
    );
    row("Client ID", status.client_id.clone());
    row("MQTT user", status.broker_username.clone());
    match &status.reading {
        Some(reading) => {
            row("Temperature", format!("{:.1} °C", reading.temperature_c));
            row("Humidity", format!("{:.1} %", reading.humidity_pct));
            row("Light", reading.light_raw.to_string());
            row("Free memory", format!("{} bytes", reading.free_memory_bytes));
            row(
                "Lowest memory",
                format!("{} bytes", reading.lowest_free_memory_bytes),
            );
        }
        None => row("Sensor", "no reading yet".to_string()),
    }
    row(
        "Night light",
        format!(
            "{} ({})",
            if status.light_on { "ON" } else { "OFF" },
            status.control_mode.as_str()
        ),
    );
    row("Data topic", status.data_topic.clone());
    row("Control topic", status.control_topic.clone());

    format!(
        r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><meta http-equiv="refresh" content="10"><title>Environment Monitor</title>
<style>body{{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto}}th{{text-align:left;padding-right:1rem}}</style>
</head>
<body>
<h1>Environment Monitor</h1>
<table>{rows}</table>
<form method="post" action="/reset"><button type="submit">Factory reset</button></form>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_lists_networks_in_scan_order() {
        let page = portal_page(&[
            ScannedNetwork {
                ssid: "Zulu".into(),
                rssi_dbm: -80,
                is_open: false,
                is_enterprise: false,
            },
            ScannedNetwork {
                ssid: "Alpha<script>".into(),
                rssi_dbm: -40,
                is_open: true,
                is_enterprise: false,
            },
        ]);

        let zulu = page.find(r#"value="Zulu""#).unwrap();
        let alpha = page.find(r#"value="Alpha&lt;script&gt;""#).unwrap();
        assert!(zulu < alpha);
        assert!(!page.contains("{{options}}"));
        assert!(!page.contains("<script>"));
    }

    #[test]
    fn escape_covers_quotes() {
        assert_eq!(escape_html(r#"a"b'c&"#), "a&quot;b&#39;c&amp;");
    }
}
