#![allow(clippy::manual_unwrap_or_default)]
use crate::types::*;
use serde::{Deserialize, Deserializer, Serialize};

/// Merge-patch for the side panel.
///
/// For each field: absent leaves the current list alone, `null` clears it,
/// and a single item or a list replaces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelPatch {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub code: Option<Option<OneOrMany<String>>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub chart: Option<Option<OneOrMany<ChartSpec>>>,
}

// Distinguishes an explicit `null` from a missing field.
fn present<'de, T, D>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl PanelPatch {
    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.chart.is_none()
    }

    /// Patch carrying whatever structured content a message produced. Kinds
    /// with nothing to show are left out of the patch.
    pub fn from_content(code: Vec<String>, charts: Vec<ChartSpec>) -> Self {
        Self {
            code: if code.is_empty() {
                None
            } else {
                Some(Some(OneOrMany::from_vec(code)))
            },
            chart: if charts.is_empty() {
                None
            } else {
                Some(Some(OneOrMany::from_vec(charts)))
            },
        }
    }

    pub fn clear_all() -> Self {
        Self {
            code: Some(None),
            chart: Some(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelTab {
    Code,
    Chart,
}

/// Visible state of the secondary viewer panel.
#[derive(Debug, Clone, PartialEq)]
pub struct SidePanel {
    open: bool,
    maximized: bool,
    active_tab: PanelTab,
    code: Vec<String>,
    charts: Vec<ChartSpec>,
    code_index: usize,
    chart_index: usize,
    chat_id: Option<ChatId>,
}

impl Default for SidePanel {
    fn default() -> Self {
        Self {
            open: false,
            maximized: false,
            active_tab: PanelTab::Chart,
            code: Vec::new(),
            charts: Vec::new(),
            code_index: 0,
            chart_index: 0,
            chat_id: None,
        }
    }
}

impl SidePanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, patch: PanelPatch) {
        let mut arrived = false;

        if let Some(code) = patch.code {
            self.code = match code {
                Some(c) => c.into_vec(),
                None => Vec::new(),
            };
            self.code_index = 0;
            arrived |= !self.code.is_empty();
        }

        if let Some(chart) = patch.chart {
            self.charts = match chart {
                Some(c) => c.into_vec(),
                None => Vec::new(),
            };
            self.chart_index = 0;
            arrived |= !self.charts.is_empty();
        }

        match (self.code.is_empty(), self.charts.is_empty()) {
            (true, true) => {
                self.open = false;
                self.maximized = false;
            }
            (false, true) => self.active_tab = PanelTab::Code,
            (true, false) => self.active_tab = PanelTab::Chart,
            (false, false) => {}
        }

        if arrived {
            self.open = true;
        }

        tracing::debug!(
            "[PANEL] open={} tab={:?} code={} charts={}",
            self.open,
            self.active_tab,
            self.code.len(),
            self.charts.len()
        );
    }

    /// Switching chats drops the previous chat's content and indices.
    pub fn switch_chat(&mut self, chat_id: &ChatId) {
        if self.chat_id.as_ref() == Some(chat_id) {
            return;
        }
        self.clear();
        self.chat_id = Some(chat_id.clone());
    }

    pub fn clear(&mut self) {
        self.apply(PanelPatch::clear_all());
    }

    /// Flips the panel, or forces it when `open` is given.
    pub fn toggle(&mut self, open: Option<bool>) {
        self.open = match open {
            Some(o) => o,
            None => !self.open,
        };
        if !self.open {
            self.maximized = false;
        }
    }

    pub fn toggle_maximize(&mut self) {
        if self.open {
            self.maximized = !self.maximized;
        }
    }

    pub fn select_tab(&mut self, tab: PanelTab) {
        self.active_tab = tab;
    }

    pub fn next(&mut self) {
        let (len, index) = self.active_list();
        if len > 1 {
            *index = (*index + 1) % len;
        }
    }

    pub fn previous(&mut self) {
        let (len, index) = self.active_list();
        if len > 1 {
            *index = (*index + len - 1) % len;
        }
    }

    fn active_list(&mut self) -> (usize, &mut usize) {
        match self.active_tab {
            PanelTab::Code => (self.code.len(), &mut self.code_index),
            PanelTab::Chart => (self.charts.len(), &mut self.chart_index),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_maximized(&self) -> bool {
        self.maximized
    }

    pub fn active_tab(&self) -> PanelTab {
        self.active_tab
    }

    pub fn code_blocks(&self) -> &[String] {
        &self.code
    }

    pub fn charts(&self) -> &[ChartSpec] {
        &self.charts
    }

    pub fn current_code(&self) -> Option<&str> {
        self.code.get(self.code_index).map(String::as_str)
    }

    pub fn current_chart(&self) -> Option<&ChartSpec> {
        self.charts.get(self.chart_index)
    }

    /// One-based position within the active list, e.g. `(2, 3)` for "2 / 3".
    pub fn position(&self) -> Option<(usize, usize)> {
        let (len, index) = match self.active_tab {
            PanelTab::Code => (self.code.len(), self.code_index),
            PanelTab::Chart => (self.charts.len(), self.chart_index),
        };
        if len == 0 {
            None
        } else {
            Some((index + 1, len))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart(title: &str) -> ChartSpec {
        ChartSpec {
            kind: "bar-standard".to_string(),
            title: Some(title.to_string()),
            description: None,
            data: Vec::new(),
            data_key: "v".to_string(),
            name_key: None,
            x_axis_key: None,
            height: None,
            color: None,
            grouped_keys: None,
        }
    }

    fn patch(json: &str) -> PanelPatch {
        match serde_json::from_str(json) {
            Ok(p) => p,
            Err(e) => panic!("bad patch {}: {}", json, e),
        }
    }

    #[test]
    fn test_patch_distinguishes_null_from_absent() {
        assert_eq!(patch("{}"), PanelPatch::default());
        assert_eq!(patch(r#"{"code": null}"#).code, Some(None));
        assert_eq!(
            patch(r#"{"code": "x"}"#).code,
            Some(Some(OneOrMany::One("x".to_string())))
        );
        assert_eq!(patch(r#"{"code": ["a","b"]}"#).chart, None);
    }

    #[test]
    fn test_first_content_opens_and_selects_tab() {
        let mut panel = SidePanel::new();
        assert!(!panel.is_open());
        panel.apply(PanelPatch::from_content(vec!["SELECT 1".to_string()], Vec::new()));
        assert!(panel.is_open());
        assert_eq!(panel.active_tab(), PanelTab::Code);
        assert_eq!(panel.current_code(), Some("SELECT 1"));
    }

    #[test]
    fn test_absent_field_keeps_other_kind() {
        let mut panel = SidePanel::new();
        panel.apply(PanelPatch::from_content(Vec::new(), vec![chart("A")]));
        panel.apply(patch(r#"{"code": "print(1)"}"#));
        assert_eq!(panel.charts().len(), 1);
        assert_eq!(panel.code_blocks().len(), 1);
        assert_eq!(panel.active_tab(), PanelTab::Chart);
    }

    #[test]
    fn test_auto_close_when_both_lists_empty() {
        let mut panel = SidePanel::new();
        panel.apply(PanelPatch::from_content(vec!["x".to_string()], vec![chart("A")]));
        panel.toggle_maximize();
        assert!(panel.is_maximized());
        panel.apply(patch(r#"{"code": null}"#));
        assert!(panel.is_open());
        assert_eq!(panel.active_tab(), PanelTab::Chart);
        panel.apply(patch(r#"{"chart": null}"#));
        assert!(!panel.is_open());
        assert!(!panel.is_maximized());
    }

    #[test]
    fn test_navigation_wraps_around() {
        let mut panel = SidePanel::new();
        panel.apply(PanelPatch::from_content(
            Vec::new(),
            vec![chart("A"), chart("B"), chart("C")],
        ));
        assert_eq!(panel.position(), Some((1, 3)));
        panel.previous();
        assert_eq!(panel.current_chart().map(|c| c.display_title()), Some("C"));
        panel.next();
        panel.next();
        assert_eq!(panel.position(), Some((2, 3)));
        panel.next();
        panel.next();
        assert_eq!(panel.position(), Some((1, 3)));
    }

    #[test]
    fn test_switch_chat_resets_index() {
        let mut panel = SidePanel::new();
        panel.switch_chat(&ChatId::from("c1"));
        panel.apply(PanelPatch::from_content(
            Vec::new(),
            vec![chart("A"), chart("B")],
        ));
        panel.next();
        assert_eq!(panel.position(), Some((2, 2)));

        panel.switch_chat(&ChatId::from("c1"));
        assert_eq!(panel.position(), Some((2, 2)));

        panel.switch_chat(&ChatId::from("c2"));
        assert!(!panel.is_open());
        assert_eq!(panel.position(), None);
        panel.apply(PanelPatch::from_content(Vec::new(), vec![chart("X")]));
        assert_eq!(panel.current_chart().map(|c| c.display_title()), Some("X"));
    }

    #[test]
    fn test_toggle_and_clear() {
        let mut panel = SidePanel::new();
        panel.toggle(None);
        assert!(panel.is_open());
        panel.toggle(Some(false));
        assert!(!panel.is_open());
        panel.apply(PanelPatch::from_content(vec!["x".to_string()], Vec::new()));
        panel.clear();
        assert!(!panel.is_open());
        assert!(panel.code_blocks().is_empty());
    }
}
