use std::fs;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use hickory_proto::rr::{DNSClass, RecordType};
use serde::Deserialize;
use tracing::info;

use crate::entry::DEFAULT_LOCAL_TTL;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// UDP监听端口，缺省53。
    #[serde(default = "default_port")]
    pub port: u16,
    /// 解析缓存容量（条目数），缺省1000。
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// 非本地域名是否递归解析，缺省关闭。
    #[serde(default)]
    pub recursive: bool,
    /// 已知服务器列表域名指向的重定向地址。
    #[serde(default)]
    pub redirect_ip: Option<String>,
    /// 作为本地 A 记录指向 `redirect_ip` 的域名列表。
    #[serde(default = "default_redirect_names")]
    pub redirect_names: Vec<String>,
    /// 查询前从域名末尾剥离的可选伪后缀。
    #[serde(default)]
    pub strip_suffix: Option<String>,
    /// 自定义的权威本地记录。
    #[serde(default)]
    pub local_entries: Vec<LocalEntrySpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            cache_size: default_cache_size(),
            recursive: false,
            redirect_ip: None,
            redirect_names: default_redirect_names(),
            strip_suffix: None,
            local_entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalEntrySpec {
    #[serde(rename = "type")]
    pub rtype: String,
    pub domain: String,
    pub record: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_class")]
    pub class: String,
}

impl LocalEntrySpec {
    pub fn record_type(&self) -> Result<RecordType> {
        match self.rtype.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::AAAA),
            "CNAME" => Ok(RecordType::CNAME),
            "NS" => Ok(RecordType::NS),
            "PTR" => Ok(RecordType::PTR),
            "TXT" => Ok(RecordType::TXT),
            other => anyhow::bail!("unknown record type: {other}"),
        }
    }

    pub fn dns_class(&self) -> Result<DNSClass> {
        match self.class.to_ascii_uppercase().as_str() {
            "IN" => Ok(DNSClass::IN),
            "CH" => Ok(DNSClass::CH),
            "HS" => Ok(DNSClass::HS),
            other => anyhow::bail!("unknown record class: {other}"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if cfg.cache_size == 0 {
        anyhow::bail!("cache_size must be at least 1");
    }
    if let Some(ip) = cfg.redirect_ip.as_ref() {
        let _parsed: IpAddr = ip
            .parse()
            .with_context(|| format!("parse redirect_ip: {ip}"))?;
    }

    info!(target = "config", path = %path.display(), entries = cfg.local_entries.len(), "config loaded");
    Ok(cfg)
}

fn default_port() -> u16 {
    53
}

fn default_cache_size() -> usize {
    1000
}

fn default_ttl() -> u32 {
    DEFAULT_LOCAL_TTL
}

fn default_class() -> String {
    "IN".to_string()
}

// The server-list hostnames the target consoles are hardwired to look up.
fn default_redirect_names() -> Vec<String> {
    [
        "hivebedrock.network",
        "geo.hivebedrock.network",
        "mco.mineplex.com",
        "play.mineplex.com",
        "play.inpvp.net",
        "mco.lbsg.net",
        "play.lbsg.net",
        "mco.cubecraft.net",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
