use std::time::Duration;

pub const ENVIRONMENTS_DIR: &str = "infrastructure/config/environments";
pub const TEMPLATES_DIR: &str = "infrastructure/config/templates";
pub const TERRAFORM_DIR: &str = "infrastructure/terraform";
pub const STATE_DIR: &str = ".trackerctl";
pub const STATE_FILE: &str = "infrastructure.json";

pub const DEFAULT_SSH_USER: &str = "torrust";
pub const REMOTE_APP_SUBDIR: &str = "github/torrust/torrust-tracker-demo";
pub const REMOTE_PERSISTENT_DIR: &str = "/var/lib/torrust";
pub const REMOTE_STAGING_DIR: &str = "/tmp/trackerctl-staging";
pub const REMOTE_ARCHIVE_PATH: &str = "/tmp/trackerctl-release.tar.gz";
pub const CLOUD_INIT_MARKER: &str = "/var/lib/cloud/torrust-setup-complete";
pub const CLOUD_INIT_LOG: &str = "/var/log/cloud-init-output.log";
pub const BACKUP_SCRIPT: &str = "share/bin/mysql-backup.sh";

pub const TRACKER_UDP_PORTS: [u16; 2] = [6868, 6969];
pub const GRAFANA_PORT: u16 = 3100;
pub const PROMETHEUS_LOCAL_URL: &str = "http://localhost:9090/-/healthy";
pub const STORAGE_DIRS: [&str; 4] = ["tracker", "mysql", "prometheus", "proxy"];

pub const VM_IP_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const VM_IP_POLL_ATTEMPTS: u32 = 30;
pub const CLOUD_INIT_POLL_INTERVAL: Duration = Duration::from_secs(20);
pub const CLOUD_INIT_POLL_ATTEMPTS: u32 = 60;
pub const SERVICE_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const SERVICE_POLL_ATTEMPTS: u32 = 60;

pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(600);
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);
pub const HTTP_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
pub const UDP_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
pub const SSH_CONNECT_TIMEOUT_SECS: u32 = 10;
pub const LOG_TAIL_LINES: u32 = 50;
