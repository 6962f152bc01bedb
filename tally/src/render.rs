//! Chart rendering.
//!
//! A [`ChartRenderer`] turns a [`SeriesDataset`] into a self-contained
//! artifact. [`EchartsRenderer`] writes an HTML page that loads ECharts and
//! embeds the dataset as JSON; the browser does the drawing. Gaps in the
//! dataset are emitted as `null`, which ECharts draws as a break in the line.
//! Axis labels use the local offset, like the subtitle and the file names.

use std::fmt;

use chrono::{Local, SecondsFormat};
use serde::Serialize;

use crate::chart::SeriesDataset;
use crate::error::ExportError;

/// Default location of the ECharts script.
pub const ECHARTS_CDN: &str = "https://cdn.jsdelivr.net/npm/echarts@5/dist/echarts.min.js";

/// Renders a dataset into a file payload.
pub trait ChartRenderer: Send + Sync + fmt::Debug {
    /// Renders `dataset` with the given title and subtitle.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Render`] if the dataset cannot be rendered.
    fn render(
        &self,
        dataset: &SeriesDataset,
        title: &str,
        subtitle: &str,
    ) -> Result<Vec<u8>, ExportError>;
}

/// Renders an interactive line chart page backed by ECharts.
#[derive(Debug, Clone)]
pub struct EchartsRenderer {
    script_src: String,
    page_title: String,
}

impl Default for EchartsRenderer {
    fn default() -> Self {
        Self {
            script_src: ECHARTS_CDN.to_string(),
            page_title: "mqtt_topics".to_string(),
        }
    }
}

impl EchartsRenderer {
    /// Creates a renderer loading ECharts from [`ECHARTS_CDN`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads ECharts from `src` instead of the CDN.
    pub fn with_script_src(mut self, src: impl Into<String>) -> Self {
        self.script_src = src.into();
        self
    }
}

#[derive(Serialize)]
struct PageSeries<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    smooth: bool,
    #[serde(rename = "connectNulls")]
    connect_nulls: bool,
    data: &'a [Option<u64>],
}

impl ChartRenderer for EchartsRenderer {
    fn render(
        &self,
        dataset: &SeriesDataset,
        title: &str,
        subtitle: &str,
    ) -> Result<Vec<u8>, ExportError> {
        let axis: Vec<String> = dataset
            .timestamps
            .iter()
            .map(|t| {
                t.with_timezone(&Local)
                    .to_rfc3339_opts(SecondsFormat::Secs, false)
            })
            .collect();
        let series: Vec<PageSeries<'_>> = dataset
            .series
            .iter()
            .map(|(name, data)| PageSeries {
                name,
                kind: "line",
                smooth: true,
                connect_nulls: false,
                data,
            })
            .collect();

        let option = serde_json::json!({
            "title": { "text": title, "subtext": subtitle },
            "legend": { "type": "scroll" },
            "tooltip": { "show": true, "trigger": "axis", "triggerOn": "mousemove" },
            "animation": true,
            "dataZoom": [{ "type": "inside" }],
            "toolbox": {
                "show": true,
                "feature": {
                    "saveAsImage": { "show": true },
                    "dataZoom": { "show": true },
                    "dataView": { "show": true },
                    "restore": { "show": true }
                }
            },
            "xAxis": { "type": "category", "data": axis },
            "yAxis": { "type": "value" },
            "series": series,
        });
        let option = serde_json::to_string(&option).map_err(|e| ExportError::Render {
            name: title.to_string(),
            reason: e.to_string(),
        })?;

        let page = format!(
            r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{page_title}</title>
<script src="{src}"></script>
</head>
<body>
<div id="chart" style="width:100%;height:100vh;"></div>
<script type="text/javascript">
"use strict";
let chart = echarts.init(document.getElementById("chart"), "dark");
chart.setOption({option});
window.addEventListener("resize", () => chart.resize());
</script>
</body>
</html>
"#,
            page_title = escape_html(&self.page_title),
            src = escape_html(&self.script_src),
            option = escape_script(&option),
        );
        Ok(page.into_bytes())
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// A topic containing "</script>" must not terminate the inline script.
fn escape_script(json: &str) -> String {
    json.replace("</", "<\\/")
}
