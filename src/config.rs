use clap::Args as ClapArgs;

const DEFAULT_PROJECT_ID: &str = "testreplaceflow";
const DEFAULT_LOCATION: &str = "asia-southeast1";
const WAREHOUSE_DIR: &str = "./warehouse";
const OBJECT_ROOT: &str = "./buckets";

#[derive(ClapArgs)]
pub struct Config {
    #[arg(long, default_value = DEFAULT_PROJECT_ID, env = "PROJECT_ID")]
    pub(crate) project_id: String,

    #[arg(long, default_value = DEFAULT_LOCATION, env = "LOCATION")]
    pub(crate) location: String,

    #[arg(long, default_value = WAREHOUSE_DIR, env = "WAREHOUSE_DIR")]
    pub(crate) warehouse_dir: String,

    #[arg(long, default_value = OBJECT_ROOT, env = "OBJECT_ROOT")]
    pub(crate) object_root: String,

    /// When set, objects are downloaded over HTTP instead of read from `object_root`.
    #[arg(long, env = "OBJECT_BASE_URL")]
    pub(crate) object_base_url: Option<String>,

    #[arg(long, env = "OBJECT_TOKEN")]
    pub(crate) object_token: Option<String>,
}
