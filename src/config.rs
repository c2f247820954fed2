use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml::Value;

/// Fatal init-time failures. Everything past construction is infallible.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown DRAM technology {0}")]
    UnknownTech(String),
    #[error("memory frequency {mem_khz} kHz too close to system frequency {sys_khz} kHz; events run on system cycles and must be able to hit every memory cycle")]
    FrequencyRatio { mem_khz: u64, sys_khz: u64 },
    #[error("page size {0} outside [64, 4096]")]
    PageSize(u64),
    #[error("cache size {cache} is not a multiple of page size {page}")]
    CacheNotPageMultiple { cache: u64, page: u64 },
    #[error("index mask has {got} bits set but the cache needs {want} index bits")]
    IndexMask { got: u32, want: u32 },
    #[error("cannot create trace directory {path}: {source}")]
    TraceDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("DRAM device library is not linked into this build")]
    DeviceMissing,
    #[error("{0}")]
    Invalid(String),
}

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found, using defaults");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SchemeKind {
    AlloyCache,
    UnisonCache,
    BansheeCache,
    NoCache,
    CacheOnly,
    CopyCache,
    #[serde(rename = "NDC")]
    Ndc,
    IdealBalanced,
    IdealAssociative,
    IdealFully,
    IdealHotness,
    #[serde(rename = "CHAMO")]
    Chamo,
}

impl Default for SchemeKind {
    fn default() -> Self {
        SchemeKind::NoCache
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageMapScheme {
    #[default]
    Identical,
    Johnny,
    Random,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Simple,
    #[serde(rename = "MD1")]
    Md1,
    #[serde(rename = "DDR")]
    Ddr,
    #[serde(alias = "DRAMSim3")]
    Device,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementKind {
    #[default]
    #[serde(rename = "LRU")]
    Lru,
    #[serde(rename = "FBR")]
    Fbr,
    Random,
}

/// Index scheme for the CHAMO family. `Rank` is the self-balancing
/// rank-arithmetic engine; the other three route through the cuckoo index
/// with the named bucket hasher.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChamoIndexKind {
    #[default]
    Rank,
    Cuckoo,
    BitMix,
    Shuffle,
}

/// Back-end timing knobs shared by the external tier and the near tier,
/// read under the respective config prefix.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DdrParams {
    pub ranks_per_channel: u32,
    pub banks_per_rank: u32,
    /// DRAM column page (row buffer) size in bytes.
    pub page_size: u32,
    pub tech: String,
    pub addr_mapping: String,
    pub defer_writes: bool,
    pub closed_page: bool,
    pub max_row_hits: u32,
    pub queue_depth: u32,
    /// In system cycles.
    pub controller_latency: u32,
}

impl Default for DdrParams {
    fn default() -> Self {
        Self {
            ranks_per_channel: 4,
            banks_per_rank: 8,
            page_size: 8 * 1024,
            tech: "DDR3-1333-CL10".to_string(),
            addr_mapping: "rank:col:bank".to_string(),
            defer_writes: true,
            closed_page: true,
            max_row_hits: 4,
            queue_depth: 16,
            controller_latency: 10,
        }
    }
}

impl Config for DdrParams {}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct McdramConfig {
    #[serde(rename = "type")]
    pub backend: BackendKind,
    /// Total near-memory capacity in MB.
    pub size: u64,
    pub cache_granularity: u64,
    pub num_ways: u64,
    pub mcdram_per_mc: u32,
    pub latency: u32,
    /// MB/s, only for the MD1 back-end.
    pub bandwidth: u32,
    pub footprint_size: u32,
    pub tag_buffer_size: u32,
    pub victim_buffer_size: u32,
    pub num_banks: u32,
    /// Page size for page-granular schemes (IdealHotness), bytes.
    pub page_size: u64,
    pub placement_policy: PlacementKind,
    pub index_mask_upper: u32,
    pub index_mask_lower: u32,
    pub ch_pos: u32,
    pub ra_pos: u32,
    pub bg_pos: u32,
    pub ba_pos: u32,
    pub ro_pos: u32,
    pub co_pos: u32,
    pub ch_mask: u32,
    pub ra_mask: u32,
    pub bg_mask: u32,
    pub ba_mask: u32,
    pub ro_mask: u32,
    pub co_mask: u32,
    pub t_cl: u32,
    pub t_cwl: u32,
    pub t_rcd: u32,
    pub t_rp: u32,
    pub t_ccd_l: u32,
    pub t_pcd: u32,
    pub t_comp: u32,
    pub utilstats_period: u64,
    pub index_scheme: ChamoIndexKind,
    pub hash_assoc: u64,
    pub bucket_assoc: u64,
    pub target_load_ratio: u64,
    pub nr_shuffle_entry: u64,
    pub shuffle_seed: u64,
    pub ddr: DdrParams,
}

impl Default for McdramConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Simple,
            size: 128,
            cache_granularity: 64,
            num_ways: 1,
            mcdram_per_mc: 4,
            latency: 50,
            bandwidth: 12800,
            footprint_size: 64,
            tag_buffer_size: 1024,
            victim_buffer_size: 8,
            num_banks: 8,
            page_size: 4096,
            placement_policy: PlacementKind::Lru,
            index_mask_upper: 0xFFFF_FFFF,
            index_mask_lower: 0xFFFF_FFFF,
            ch_pos: 12,
            ra_pos: 11,
            bg_pos: 7,
            ba_pos: 9,
            ro_pos: 13,
            co_pos: 0,
            ch_mask: 1,
            ra_mask: 1,
            bg_mask: 3,
            ba_mask: 3,
            ro_mask: 16383,
            co_mask: 127,
            t_cl: 10,
            t_cwl: 8,
            t_rcd: 10,
            t_rp: 10,
            t_ccd_l: 4,
            t_pcd: 2,
            t_comp: 2,
            utilstats_period: 0,
            index_scheme: ChamoIndexKind::Rank,
            hash_assoc: 4,
            bucket_assoc: 1,
            target_load_ratio: 95,
            nr_shuffle_entry: 64,
            shuffle_seed: 0,
            ddr: DdrParams::default(),
        }
    }
}

impl Config for McdramConfig {}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtDramConfig {
    #[serde(rename = "type")]
    pub backend: BackendKind,
    /// External tier capacity in MB; bounds the line/page universe the
    /// ideal and CHAMO schemes index over.
    pub size: u64,
    pub latency: u32,
    /// MB/s, only for the MD1 back-end.
    pub bandwidth: u32,
    pub config_ini: String,
    pub output_dir: String,
    pub trace_name: String,
    pub capacity_mb: u32,
    pub ddr: DdrParams,
}

impl Default for ExtDramConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Simple,
            size: 1024,
            latency: 100,
            bandwidth: 6400,
            config_ini: String::new(),
            output_dir: String::new(),
            trace_name: "device".to_string(),
            capacity_mb: 16384,
            ddr: DdrParams::default(),
        }
    }
}

impl Config for ExtDramConfig {}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemConfig {
    pub cache_scheme: SchemeKind,
    pub pagemap_scheme: PageMapScheme,
    /// OS page size used by the page mapper, bytes.
    pub page_size: u64,
    /// Mapping granule for Johnny/Random page maps; 0 means page_size.
    pub map_granu: u64,
    pub enable_trace: bool,
    pub trace_dir: String,
    pub bw_balance: bool,
    pub sram_tag: bool,
    pub dram_timing_scale: f64,
    pub controllers: u32,
    pub mcdram: McdramConfig,
    pub ext_dram: ExtDramConfig,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            cache_scheme: SchemeKind::NoCache,
            pagemap_scheme: PageMapScheme::Identical,
            page_size: 4096,
            map_granu: 0,
            enable_trace: false,
            trace_dir: "./".to_string(),
            bw_balance: false,
            sram_tag: false,
            dram_timing_scale: 1.0,
            controllers: 1,
            mcdram: McdramConfig::default(),
            ext_dram: ExtDramConfig::default(),
        }
    }
}

impl Config for MemConfig {}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct L3Config {
    pub latency: u32,
}

impl Default for L3Config {
    fn default() -> Self {
        Self { latency: 30 }
    }
}

impl Config for L3Config {}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(default)]
pub struct CachesConfig {
    pub l3: L3Config,
}

impl Config for CachesConfig {}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimSection {
    pub max_total_instrs: u64,
    pub phase_length: u64,
    pub stats_phase_interval: u64,
    pub output_phase_interval: u64,
    pub log_to_file: bool,
    pub sys_freq_mhz: u32,
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            max_total_instrs: 0,
            phase_length: 10000,
            stats_phase_interval: 100,
            output_phase_interval: 0,
            log_to_file: false,
            sys_freq_mhz: 4000,
        }
    }
}

impl Config for SimSection {}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StratusConfig {
    pub sim: SimSection,
    pub mem: MemConfig,
    pub caches: CachesConfig,
}

impl Config for StratusConfig {}

impl StratusConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Init-time validation shared by all schemes. Anything wrong here is
    /// fatal before the first request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let page = self.mem.mcdram.page_size;
        if !(64..=4096).contains(&page) {
            return Err(ConfigError::PageSize(page));
        }
        let cache_bytes = self.mem.mcdram.size * 1024 * 1024;
        if cache_bytes % page != 0 {
            return Err(ConfigError::CacheNotPageMultiple {
                cache: cache_bytes,
                page,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_config() {
        let cfg = StratusConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.mem.cache_scheme, SchemeKind::NoCache);
        assert_eq!(cfg.mem.mcdram.mcdram_per_mc, 4);
        assert_eq!(cfg.mem.ext_dram.latency, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn scheme_names_match_config_surface() {
        let cfg = StratusConfig::from_toml_str(
            "[mem]\ncache_scheme = \"NDC\"\npagemap_scheme = \"Johnny\"\n",
        )
        .unwrap();
        assert_eq!(cfg.mem.cache_scheme, SchemeKind::Ndc);
        assert_eq!(cfg.mem.pagemap_scheme, PageMapScheme::Johnny);
    }

    #[test]
    fn unknown_scheme_is_fatal() {
        assert!(StratusConfig::from_toml_str("[mem]\ncache_scheme = \"Mystery\"\n").is_err());
    }

    #[test]
    fn bad_page_size_rejected() {
        let mut cfg = StratusConfig::default();
        cfg.mem.mcdram.page_size = 8192;
        assert!(matches!(cfg.validate(), Err(ConfigError::PageSize(8192))));
    }

    #[test]
    fn device_alias_accepted() {
        let cfg = StratusConfig::from_toml_str("[mem.ext_dram]\ntype = \"DRAMSim3\"\n").unwrap();
        assert_eq!(cfg.mem.ext_dram.backend, BackendKind::Device);
    }
}
