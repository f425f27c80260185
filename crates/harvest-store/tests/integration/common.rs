use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harvest_client::{FieldNormalizer, ReqwestFetcher, ReqwestRobotsSource, RuleExtractorFactory};
use harvest_core::Pipeline;
use harvest_core::job::CrawlConfig;
use harvest_core::registry::SourceRegistry;
use harvest_store::FsStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub type FsPipeline =
    Pipeline<ReqwestFetcher, ReqwestRobotsSource, RuleExtractorFactory, FieldNormalizer, FsStore>;

#[derive(Clone)]
struct Route {
    body: String,
    etag: String,
}

/// Local HTTP site answering GETs from a route table.
///
/// Every page carries an ETag; a matching `If-None-Match` gets a 304.
/// Unknown paths (including `/robots.txt`) are 404.
#[derive(Clone)]
pub struct TestSite {
    pub base: String,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    hits: Arc<Mutex<Vec<(String, u16)>>>,
}

impl TestSite {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let site = Self {
            base: format!("http://{}", listener.local_addr().unwrap()),
            routes: Arc::default(),
            hits: Arc::default(),
        };

        let server = site.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let server = server.clone();
                tokio::spawn(async move { server.handle(socket).await });
            }
        });
        site
    }

    pub fn page(&self, path: &str, body: impl Into<String>) {
        let body = body.into();
        let etag = format!("\"{}\"", &harvest_core::compute_hash(&body)[..12]);
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Route { body, etag });
    }

    /// Responses served for `path`, by status.
    pub fn hits(&self, path: &str) -> Vec<u16> {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, status)| *status)
            .collect()
    }

    async fn handle(&self, mut socket: TcpStream) {
        let mut request = Vec::new();
        let mut buf = [0u8; 2048];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let request = String::from_utf8_lossy(&request).to_string();
        let path = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();
        let if_none_match = request.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("if-none-match")
                .then(|| value.trim().to_string())
        });

        let route = self.routes.lock().unwrap().get(&path).cloned();
        let response = match route {
            Some(route) if if_none_match.as_deref() == Some(route.etag.as_str()) => {
                self.record(&path, 304);
                format!(
                    "HTTP/1.1 304 Not Modified\r\nETag: {}\r\nConnection: close\r\n\r\n",
                    route.etag
                )
            }
            Some(route) => {
                self.record(&path, 200);
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nETag: {}\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    route.etag,
                    route.body.len(),
                    route.body
                )
            }
            None => {
                self.record(&path, 404);
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_string()
            }
        };
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
    }

    fn record(&self, path: &str, status: u16) {
        self.hits.lock().unwrap().push((path.to_string(), status));
    }
}

/// Pipeline over the real client stack and a store rooted at `data_root`.
pub fn pipeline(data_root: &Path) -> FsPipeline {
    let fetcher = ReqwestFetcher::with_timeout(Duration::from_secs(10)).unwrap();
    let robots = ReqwestRobotsSource::from_fetcher(&fetcher);
    Pipeline::new(
        fetcher,
        robots,
        RuleExtractorFactory::new(),
        FieldNormalizer::new().unwrap(),
        FsStore::new(data_root),
    )
    .with_config(
        CrawlConfig::default()
            .with_fetch_timeout(Duration::from_secs(5))
            .with_grace_period(Duration::from_millis(200)),
    )
}

/// Write a one-source registry plus its rule file into `dir`.
pub fn write_registry(dir: &Path, source_id: &str, base_url: &str, rules: &str) -> SourceRegistry {
    std::fs::write(dir.join(format!("{source_id}.rules.json")), rules).unwrap();
    let csv = format!(
        "source_id,base_url,type,qps_limit,concurrency_limit,enabled,interval,rules_path,max_pages\n\
         {source_id},{base_url},events,50,1,true,daily,{source_id}.rules.json,\n"
    );
    let path = dir.join("sources.csv");
    std::fs::write(&path, csv).unwrap();
    SourceRegistry::load(&path).unwrap()
}

pub const GIG_RULES: &str = r#"{
    "list_item": "li.gig",
    "fields": {
        "title": ".name",
        "start": "time@datetime",
        "city": ".city",
        "country": ".country"
    },
    "pagination": {"next_selector": "a.next", "max_pages": 5},
    "timezone": "UTC+02:00"
}"#;

pub const AGENDA_PAGE_1: &str = r#"<html><head>
<script type="application/ld+json">
{"@context": "https://schema.org", "@type": "MusicEvent", "name": "Jazz Night",
 "startDate": "2026-07-10T20:00:00+02:00",
 "location": {"@type": "Place", "name": "Blue Room",
              "address": {"addressLocality": "Lyon", "addressCountry": "FR"}}}
</script></head>
<body><ul>
  <li class="gig"><span class="name">Brass Band</span>
      <time datetime="2026-07-11T19:30">11 Jul</time>
      <span class="city">Lyon</span><span class="country">fr</span></li>
  <li class="gig"><span class="name">Nowhere Trio</span>
      <time datetime="2026-07-12T19:30">12 Jul</time>
      <span class="city">Lyon</span></li>
</ul>
<a class="next" href="/agenda?page=2">next</a>
</body></html>"#;

pub const AGENDA_PAGE_2: &str = r#"<html><body><ul>
  <li class="gig"><span class="name">Folk Evening</span>
      <time datetime="2026-07-13T18:00">13 Jul</time>
      <span class="city">Lyon</span><span class="country">FR</span></li>
</ul></body></html>"#;
