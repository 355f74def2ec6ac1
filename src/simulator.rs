use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::channel::{ChannelAccess, ChannelError};
use crate::config::SimulatorConfig;
use crate::fit::{error_function, gaussian};
use crate::pv_codec::{PvRequest, PvResponse, PvServerCodec};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Access {
    ReadOnly,
    /// Writable command channel, puts propagate to the readback
    Command,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    value: f64,
    access: Access,
}

/// Dummy instrument: two stages with noisy readbacks and detectors.
pub struct SimulatedInstrument {
    prefix: String,
    config: SimulatorConfig,
    records: BTreeMap<String, Record>,
    rng: StdRng,
}

pub const MOTORS: [&str; 3] = ["theta", "z", "time"];
pub const DETECTORS: [&str; 2] = ["gaussian_noise", "intensity"];

impl SimulatedInstrument {
    pub fn new(config: SimulatorConfig) -> Self {
        let prefix = config.prefix.clone();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut records = BTreeMap::new();
        for motor in MOTORS {
            records.insert(
                format!("{prefix}{motor}.VAL"),
                Record {
                    value: 0.0,
                    access: Access::Command,
                },
            );
            records.insert(
                format!("{prefix}{motor}.RBV"),
                Record {
                    value: 0.0,
                    access: Access::ReadOnly,
                },
            );
        }
        for detector in DETECTORS {
            records.insert(
                format!("{prefix}{detector}"),
                Record {
                    value: 0.0,
                    access: Access::ReadOnly,
                },
            );
        }

        let theta_center = config.theta_center;
        let mut instrument = Self {
            prefix,
            config,
            records,
            rng,
        };
        // the sample starts roughly tilted into the beam
        for suffix in [".VAL", ".RBV"] {
            let name = format!("{}theta{}", instrument.prefix, suffix);
            instrument.store(&name, theta_center);
        }
        instrument.scan();
        instrument
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(|k| k.as_str())
    }

    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.config.scan_period_ms)
    }

    pub fn handle(&mut self, req: PvRequest) -> PvResponse {
        match req {
            PvRequest::Get(name) => match self.records.get(&name) {
                Some(r) => PvResponse::Ok(r.value),
                None => PvResponse::Err(format!("Unknown channel {name}")),
            },
            PvRequest::Put(name, value) => self.put(&name, value),
            PvRequest::Malformed(line) => PvResponse::Err(format!("malformed request: {line}")),
        }
    }

    fn put(&mut self, name: &str, value: f64) -> PvResponse {
        if !value.is_finite() {
            return PvResponse::Err(format!("Invalid value {value} for {name}"));
        }
        match self.records.get(name).map(|r| r.access) {
            None => PvResponse::Err(format!("Unknown channel {name}")),
            Some(Access::ReadOnly) => PvResponse::Err(format!("Channel {name} is read-only")),
            Some(Access::Command) => {
                let readback = name
                    .strip_suffix(".VAL")
                    .map(|base| format!("{base}.RBV"))
                    .unwrap_or_default();
                let time_base = format!("{}time.VAL", self.prefix);

                self.store(name, value);
                if name != time_base {
                    let noise = self.noise(self.config.motor_noise);
                    self.store(&readback, value + noise);
                    tracing::debug!("{} <- {}", name, value);
                    self.update_intensity();
                }
                PvResponse::Ok(value)
            }
        }
    }

    /// Periodic update of the free-running channels
    pub fn scan(&mut self) {
        let noise = self.noise(1.0);
        self.store(&format!("{}gaussian_noise", self.prefix), noise);

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.store(&format!("{}time.RBV", self.prefix), now);

        self.update_intensity();
    }

    fn update_intensity(&mut self) {
        let z = self.value(&format!("{}z.RBV", self.prefix));
        let theta = self.value(&format!("{}theta.RBV", self.prefix));
        let c = &self.config;

        let signal = error_function(z, c.z_center, 1.0, c.z_width)
            * gaussian(theta, c.theta_center, c.theta_width, 1.0);
        let noise = self.noise(self.config.detector_noise);
        self.store(&format!("{}intensity", self.prefix), signal + noise);
    }

    fn noise(&mut self, sigma: f64) -> f64 {
        match Normal::new(0.0, sigma) {
            Ok(n) if sigma > 0.0 => n.sample(&mut self.rng),
            _ => 0.0,
        }
    }

    fn value(&self, name: &str) -> f64 {
        self.records.get(name).map(|r| r.value).unwrap_or_default()
    }

    fn store(&mut self, name: &str, value: f64) {
        if let Some(r) = self.records.get_mut(name) {
            r.value = value;
        }
    }
}

impl SimulatedInstrument {
    fn respond(&mut self, req: PvRequest, channel: &str) -> Result<f64, ChannelError> {
        match self.handle(req) {
            PvResponse::Ok(v) => Ok(v),
            PvResponse::Err(message) => Err(ChannelError::Rejected {
                channel: channel.to_owned(),
                message,
            }),
        }
    }
}

/// In-process access, for headless runs without a PV server.
impl ChannelAccess for SimulatedInstrument {
    async fn get(&mut self, channel: &str, _timeout: Duration) -> Result<f64, ChannelError> {
        self.respond(PvRequest::Get(channel.to_owned()), channel)
    }

    async fn set(
        &mut self,
        channel: &str,
        value: f64,
        _timeout: Duration,
    ) -> Result<(), ChannelError> {
        self.respond(PvRequest::Put(channel.to_owned(), value), channel)
            .map(|_| ())
    }
}

/// Periodic `scan()` task, stopped together with the server.
struct RefreshTask(JoinHandle<()>);

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Accept connections until the listener fails, one task per client.
pub async fn serve(
    listener: TcpListener,
    instrument: Arc<Mutex<SimulatedInstrument>>,
) -> std::io::Result<()> {
    let period = instrument.lock().await.scan_period();
    let _refresh = {
        let instrument = instrument.clone();
        RefreshTask(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                instrument.lock().await.scan();
            }
        }))
    };

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!("Client {} connected", peer);
        tokio::spawn(handle_client(stream, instrument.clone(), peer));
    }
}

async fn handle_client(
    stream: TcpStream,
    instrument: Arc<Mutex<SimulatedInstrument>>,
    peer: std::net::SocketAddr,
) {
    let mut framed = Framed::new(stream, PvServerCodec::default());

    while let Some(req) = framed.next().await {
        let resp = match req {
            Ok(req) => instrument.lock().await.handle(req),
            Err(e) => {
                tracing::warn!("Client {}: {}", peer, e);
                break;
            }
        };
        if let Err(e) = framed.send(resp).await {
            tracing::warn!("Client {}: {}", peer, e);
            break;
        }
    }
    tracing::info!("Client {} disconnected", peer);
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::pv_client::PvClient;

    fn quiet_config() -> SimulatorConfig {
        SimulatorConfig {
            motor_noise: 0.0,
            detector_noise: 0.0,
            seed: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn put_updates_readback() {
        let mut sim = SimulatedInstrument::new(quiet_config());

        assert_eq!(
            sim.handle(PvRequest::Put("sim:z.VAL".to_owned(), 1.25)),
            PvResponse::Ok(1.25)
        );
        assert_eq!(
            sim.handle(PvRequest::Get("sim:z.RBV".to_owned())),
            PvResponse::Ok(1.25)
        );
    }

    #[test]
    fn noisy_readback_stays_close() {
        let mut sim = SimulatedInstrument::new(SimulatorConfig {
            seed: Some(7),
            ..Default::default()
        });
        sim.handle(PvRequest::Put("sim:theta.VAL".to_owned(), 3.0));
        let PvResponse::Ok(rbv) = sim.handle(PvRequest::Get("sim:theta.RBV".to_owned())) else {
            panic!("no readback");
        };
        assert!((rbv - 3.0).abs() < 0.1, "{rbv}");
    }

    #[test]
    fn rejects_bad_requests() {
        let mut sim = SimulatedInstrument::new(quiet_config());

        assert!(matches!(
            sim.handle(PvRequest::Get("sim:nope".to_owned())),
            PvResponse::Err(_)
        ));
        assert!(matches!(
            sim.handle(PvRequest::Put("sim:z.RBV".to_owned(), 1.0)),
            PvResponse::Err(_)
        ));
        assert!(matches!(
            sim.handle(PvRequest::Put("sim:intensity".to_owned(), 1.0)),
            PvResponse::Err(_)
        ));
        assert!(matches!(
            sim.handle(PvRequest::Malformed("HELLO".to_owned())),
            PvResponse::Err(_)
        ));
    }

    #[test]
    fn intensity_follows_stages() {
        let config = quiet_config();
        let mut sim = SimulatedInstrument::new(config.clone());
        sim.handle(PvRequest::Put("sim:z.VAL".to_owned(), config.z_center));
        sim.handle(PvRequest::Put("sim:theta.VAL".to_owned(), config.theta_center));

        assert_eq!(
            sim.handle(PvRequest::Get("sim:intensity".to_owned())),
            PvResponse::Ok(0.5)
        );
    }

    #[test]
    fn channel_list() {
        let sim = SimulatedInstrument::new(quiet_config());
        let names = sim.channel_names().collect::<Vec<_>>();
        assert_eq!(names.len(), MOTORS.len() * 2 + DETECTORS.len());
        assert!(names.contains(&"sim:gaussian_noise"));
        assert!(names.contains(&"sim:time.RBV"));
    }

    #[tokio::test]
    async fn in_process_channels() {
        let config = quiet_config();
        let mut sim = SimulatedInstrument::new(config.clone());
        let timeout = Duration::from_millis(10);

        // theta starts on the peak
        assert_eq!(sim.get("sim:theta.RBV", timeout).await.unwrap(), config.theta_center);

        sim.set("sim:z.VAL", config.z_center, timeout).await.unwrap();
        assert_eq!(sim.get("sim:intensity", timeout).await.unwrap(), 0.5);

        match sim.set("sim:intensity", 1.0, timeout).await {
            Err(ChannelError::Rejected { channel, .. }) => assert_eq!(channel, "sim:intensity"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_stops_with_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sim = Arc::new(Mutex::new(SimulatedInstrument::new(quiet_config())));
        let server = tokio::spawn(serve(listener, sim.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        // server and refresh task hold the instrument
        assert_eq!(Arc::strong_count(&sim), 3);

        server.abort();
        assert!(server.await.unwrap_err().is_cancelled());
        for _ in 0..100 {
            if Arc::strong_count(&sim) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(&sim), 1);
    }

    #[tokio::test]
    async fn serve_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sim = Arc::new(Mutex::new(SimulatedInstrument::new(quiet_config())));
        tokio::spawn(serve(listener, sim));

        let timeout = Duration::from_secs(1);
        let mut client = PvClient::new(addr.to_string());

        client.set("sim:theta.VAL", -0.5, timeout).await.unwrap();
        assert_eq!(client.get("sim:theta.RBV", timeout).await.unwrap(), -0.5);

        match client.get("sim:missing", timeout).await {
            Err(ChannelError::Rejected { channel, .. }) => assert_eq!(channel, "sim:missing"),
            other => panic!("unexpected {other:?}"),
        }

        // connection is still usable after a rejected request
        assert!(client.get("sim:gaussian_noise", timeout).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = PvClient::new(addr.to_string());
        let res = client.get("sim:z.RBV", Duration::from_millis(500)).await;
        assert!(matches!(
            res,
            Err(ChannelError::Io { .. }) | Err(ChannelError::Timeout { .. })
        ));
    }
}
