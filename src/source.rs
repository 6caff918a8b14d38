/// Ad platforms whose exports land in the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    CampaignManager,
    DisplayVideo,
    IronSource,
}

/// What a column means, resolved once per column before any coercion runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Identifier,
    Date,
    Time,
    Metric,
    Passthrough,
}

/// One source column and the unified name it is loaded under.
#[derive(Debug)]
pub struct FieldMapping {
    pub source: &'static str,
    pub target: &'static str,
    pub role: FieldRole,
}

const fn field(source: &'static str, target: &'static str, role: FieldRole) -> FieldMapping {
    FieldMapping {
        source,
        target,
        role,
    }
}

#[derive(Debug)]
pub struct MappingTable {
    pub version: u16,
    pub fields: &'static [FieldMapping],
}

impl MappingTable {
    pub fn find(&self, source_column: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.source == source_column)
    }
}

/// How a source lays out its CSV export.
#[derive(Debug)]
pub struct CsvLayout {
    /// Lines before the header row.
    pub preamble_lines: usize,
    /// The last row is a totals row.
    pub drop_footer: bool,
    /// Rows where this (sanitized) column is empty are placeholders.
    pub required_field: Option<&'static str>,
}

#[derive(Debug)]
pub struct SourceProfile {
    pub source: Source,
    pub prefix: &'static str,
    pub csv: CsvLayout,
    /// Position of the top-level key holding the record array.
    pub json_records_key: Option<usize>,
    pub partition_field: &'static str,
    pub mapping: Option<&'static MappingTable>,
}

use FieldRole::{Date, Identifier, Metric, Passthrough};

static CM_MAPPING: MappingTable = MappingTable {
    version: 1,
    fields: &[
        field("Advertiser", "advertiser_name", Passthrough),
        field("AdvertiserID", "advertiser_id", Identifier),
        field("Campaign", "campaign_name", Passthrough),
        field("CampaignID", "campaign_id", Identifier),
        field("Placement", "ad_group_name", Passthrough),
        field("PlacementID", "ad_group_id", Identifier),
        field("Ad", "ad_name", Passthrough),
        field("AdID", "ad_id", Identifier),
        field("Creative", "creative_name", Passthrough),
        field("CreativeID", "creative_id", Identifier),
        field("Country", "country", Passthrough),
        field("City", "city", Passthrough),
        field("Date", "date", Date),
        field("Impressions", "impressions", Metric),
        field("Clicks", "clicks", Metric),
        field("VideoFirstQuartileCompletions", "video_views", Metric),
        field("VideoCompletions", "completed_views", Metric),
        field("AudioFirstQuartileCompletions", "audio_listens", Metric),
        field("AudioCompletions", "completed_listens", Metric),
        field("CompanionViews", "ec_impressions", Metric),
        field("CompanionClicks", "ec_clicks", Metric),
        field("account_api_id", "account_api_id", Identifier),
    ],
};

static DV_MAPPING: MappingTable = MappingTable {
    version: 1,
    fields: &[
        field("AdvertiserID", "advertiser_id", Identifier),
        field("CampaignID", "campaign_id", Identifier),
        field("InsertionOrderID", "ad_group_id", Identifier),
        field("LineItemID", "ad_id", Identifier),
        field("CreativeID", "creative_id", Identifier),
        field("CountryName", "country", Passthrough),
        field("City", "city", Passthrough),
        field("Date", "date", Date),
        field("BillableImpressions", "impressions", Metric),
        field("Clicks", "clicks", Metric),
        field("FirstQuartileViews_Video", "video_views", Metric),
        field("CompleteViews_Video", "completed_views", Metric),
        field("FirstQuartile_Audio", "audio_listens", Metric),
        field("CompleteListens_Audio", "completed_listens", Metric),
        field("CompanionViews_Video", "ec_impressions", Metric),
        field("CompanionClicks_Video", "ec_clicks", Metric),
        field("account_api_id", "account_api_id", Identifier),
    ],
};

static PROFILES: [SourceProfile; 3] = [
    SourceProfile {
        source: Source::CampaignManager,
        prefix: "cm",
        csv: CsvLayout {
            preamble_lines: 10,
            drop_footer: true,
            required_field: None,
        },
        json_records_key: Some(2),
        partition_field: "Date",
        mapping: Some(&CM_MAPPING),
    },
    SourceProfile {
        source: Source::DisplayVideo,
        prefix: "dv",
        csv: CsvLayout {
            preamble_lines: 0,
            drop_footer: false,
            required_field: Some("LineItemID"),
        },
        json_records_key: Some(0),
        partition_field: "Date",
        mapping: Some(&DV_MAPPING),
    },
    SourceProfile {
        source: Source::IronSource,
        prefix: "ironsource",
        csv: CsvLayout {
            preamble_lines: 0,
            drop_footer: false,
            required_field: None,
        },
        json_records_key: None,
        partition_field: "Time",
        mapping: None,
    },
];

impl Source {
    /// Picks the source whose prefix the dataset id starts with.
    pub fn detect(dataset_id: &str) -> Option<&'static SourceProfile> {
        PROFILES.iter().find(|p| dataset_id.starts_with(p.prefix))
    }

    #[cfg(test)]
    pub fn profile(self) -> &'static SourceProfile {
        match self {
            Source::CampaignManager => &PROFILES[0],
            Source::DisplayVideo => &PROFILES[1],
            Source::IronSource => &PROFILES[2],
        }
    }
}

impl SourceProfile {
    /// Declared role for a column, falling back to the naming convention the
    /// exports follow for everything the mapping table does not mention.
    pub fn role_of(&self, raw_name: &str) -> FieldRole {
        let declared = self
            .mapping
            .and_then(|m| m.find(&sanitize_column_name(raw_name)))
            .map(|f| f.role);

        declared.unwrap_or_else(|| role_by_name(raw_name))
    }
}

/// Role of a column nothing declares anything about.
pub fn role_by_name(raw_name: &str) -> FieldRole {
    if raw_name == "Date" {
        FieldRole::Date
    } else if raw_name == "Time" {
        FieldRole::Time
    } else if raw_name.contains("ID") {
        FieldRole::Identifier
    } else {
        FieldRole::Passthrough
    }
}

/// Makes a header usable as a warehouse column name.
pub fn sanitize_column_name(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            ' ' | ')' | '-' => None,
            '.' | '(' => Some('_'),
            c => Some(c),
        })
        .collect()
}
