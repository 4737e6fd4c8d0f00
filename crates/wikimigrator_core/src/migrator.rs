//! Destination-agnostic migration driver.
//!
//! Units come from the sequencer oldest first. A unit whose page is not in
//! the ledger creates it, a newer revision of a known page updates it, and
//! anything at or below the recorded revision is skipped without a single
//! remote call. The ledger is only mutated after the matching destination
//! call succeeded.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info};

use crate::dokuwiki::SourceApi;
use crate::media::{self, MediaResolution};
use crate::page_path::{PagePath, map_page_id};
use crate::progress::{ContainerRef, MigrationProgress, PageRef};
use crate::rewrite::{self, MediaRef, Rewritten};
use crate::sequencer::{self, PageUnit, SequencerOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    BookStack,
    WikiJs,
    DokuWiki,
}

impl DestinationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BookStack => "bookstack",
            Self::WikiJs => "wikijs",
            Self::DokuWiki => "dokuwiki",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLayout {
    /// Pages live in containers and optional subcontainers.
    Hierarchical,
    /// Pages are addressed by path alone.
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    Html,
    WikiText,
}

/// Everything a destination needs to create a page.
#[derive(Debug, Clone, Copy)]
pub struct NewPage<'a> {
    pub page_id: &'a str,
    pub path: &'a PagePath,
    pub container: Option<&'a ContainerRef>,
    pub subcontainer: Option<&'a ContainerRef>,
    pub content: &'a str,
}

#[derive(Debug)]
pub struct MediaUpload<'a> {
    pub media: &'a MediaRef,
    pub bytes: Vec<u8>,
}

pub trait Destination {
    fn kind(&self) -> DestinationKind;
    fn layout(&self) -> PageLayout;

    fn content_format(&self) -> ContentFormat {
        ContentFormat::Html
    }

    /// Ledger key of a page.
    fn page_key(&self, page_id: &str, path: &PagePath) -> String;

    fn create_container(&mut self, slug: &str) -> Result<ContainerRef> {
        bail!("{} has no containers (requested {slug})", self.kind().as_str())
    }

    fn create_subcontainer(&mut self, container: &ContainerRef, slug: &str) -> Result<ContainerRef> {
        bail!(
            "{} has no subcontainers (requested {}/{slug})",
            self.kind().as_str(),
            container.slug
        )
    }

    fn create_page(&mut self, page: &NewPage<'_>) -> Result<PageRef>;
    fn update_page(&mut self, page: &PageRef, content: &str) -> Result<()>;

    /// Whether uploads must be attached to an existing page.
    fn media_needs_page(&self) -> bool {
        false
    }

    fn upload_media(
        &mut self,
        upload: MediaUpload<'_>,
        page: Option<&PageRef>,
        progress: &mut MigrationProgress,
    ) -> Result<String>;

    /// Destination address of an already migrated page.
    fn address_for(&self, page_id: &str, progress: &MigrationProgress) -> Option<String>;

    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub units: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub containers_created: usize,
    pub media_uploaded: usize,
    pub media_reused: usize,
    pub source_requests: usize,
    pub destination_requests: usize,
}

pub struct Migrator<'a, S: ?Sized, D: ?Sized> {
    source: &'a mut S,
    destination: &'a mut D,
    progress: &'a mut MigrationProgress,
    options: SequencerOptions,
    report: MigrationReport,
}

impl<'a, S, D> Migrator<'a, S, D>
where
    S: SourceApi + ?Sized,
    D: Destination + ?Sized,
{
    pub fn new(
        source: &'a mut S,
        destination: &'a mut D,
        progress: &'a mut MigrationProgress,
        options: SequencerOptions,
    ) -> Self {
        Self {
            source,
            destination,
            progress,
            options,
            report: MigrationReport::default(),
        }
    }

    /// Counters so far, also meaningful after `migrate` failed.
    pub fn report(&self) -> &MigrationReport {
        &self.report
    }

    pub fn migrate(&mut self) -> Result<MigrationReport> {
        let result = self.run();
        self.report.source_requests = self.source.request_count();
        self.report.destination_requests = self.destination.request_count();
        result.map(|()| self.report.clone())
    }

    fn run(&mut self) -> Result<()> {
        let units = sequencer::enumerate(&mut *self.source, &self.options)?;
        info!(
            units = units.len(),
            destination = self.destination.kind().as_str(),
            "starting migration"
        );
        for unit in &units {
            self.migrate_unit(unit).with_context(|| {
                format!("failed to migrate {} at revision {}", unit.page_id, unit.revision)
            })?;
        }
        info!(
            created = self.report.created,
            updated = self.report.updated,
            skipped = self.report.skipped,
            "migration finished"
        );
        Ok(())
    }

    fn migrate_unit(&mut self, unit: &PageUnit) -> Result<()> {
        self.report.units += 1;
        let path = map_page_id(&unit.page_id)?;
        let key = self.destination.page_key(&unit.page_id, &path);
        if self.progress.is_migrated(&key, unit.revision) {
            debug!(page_id = %unit.page_id, revision = unit.revision, "revision already migrated");
            self.report.skipped += 1;
            return Ok(());
        }
        match self.progress.page(&key).map(|migrated| migrated.page.clone()) {
            Some(page) => self.update_page(unit, &key, &page),
            None => self.create_page(unit, &key, &path),
        }
    }

    fn create_page(&mut self, unit: &PageUnit, key: &str, path: &PagePath) -> Result<()> {
        let (container, subcontainer) = match self.destination.layout() {
            PageLayout::Hierarchical => {
                let container = self.ensure_container(&path.container)?;
                let subcontainer = self.ensure_subcontainer(&container, path)?;
                (Some(container), subcontainer)
            }
            PageLayout::Flat => (None, None),
        };

        let content = self.fetch_content(unit, None)?;
        let page = self.destination.create_page(&NewPage {
            page_id: &unit.page_id,
            path,
            container: container.as_ref(),
            subcontainer: subcontainer.as_ref(),
            content: &content,
        })?;
        info!(
            page_id = %unit.page_id,
            revision = unit.revision,
            destination_id = %page.id,
            "created page"
        );
        self.progress.insert_page(key, page.clone(), unit.revision);
        self.report.created += 1;

        // Media held back until the page existed.
        if self.destination.content_format() == ContentFormat::Html {
            let attached = self.rewrite_media(&content, Some(&page))?;
            if attached.changed {
                self.destination.update_page(&page, &attached.html)?;
            }
        }
        Ok(())
    }

    fn update_page(&mut self, unit: &PageUnit, key: &str, page: &PageRef) -> Result<()> {
        let content = self.fetch_content(unit, Some(page))?;
        self.destination.update_page(page, &content)?;
        self.progress.record_revision(key, unit.revision);
        self.report.updated += 1;
        info!(page_id = %unit.page_id, revision = unit.revision, "updated page");
        Ok(())
    }

    fn fetch_content(&mut self, unit: &PageUnit, page: Option<&PageRef>) -> Result<String> {
        let revision = unit.fetch_revision();
        let html = self
            .source
            .get_page_html(&unit.page_id, revision)
            .with_context(|| format!("failed to fetch HTML of {}", unit.page_id))?;
        match self.destination.content_format() {
            ContentFormat::Html => {
                let html = self.rewrite_media(&html, page)?.html;
                Ok(self.rewrite_links(&html).html)
            }
            ContentFormat::WikiText => {
                self.rewrite_media(&html, page)?;
                self.source
                    .get_page(&unit.page_id, revision)
                    .with_context(|| format!("failed to fetch text of {}", unit.page_id))
            }
        }
    }

    fn ensure_container(&mut self, slug: &str) -> Result<ContainerRef> {
        if let Some(container) = self.progress.containers.get(slug) {
            return Ok(container.clone());
        }
        let container = self.destination.create_container(slug)?;
        info!(slug, destination_id = %container.id, "created container");
        self.progress
            .containers
            .insert(slug.to_string(), container.clone());
        self.report.containers_created += 1;
        Ok(container)
    }

    fn ensure_subcontainer(
        &mut self,
        container: &ContainerRef,
        path: &PagePath,
    ) -> Result<Option<ContainerRef>> {
        let (Some(slug), Some(key)) = (&path.subcontainer, path.subcontainer_key()) else {
            return Ok(None);
        };
        if let Some(subcontainer) = self.progress.subcontainers.get(&key) {
            return Ok(Some(subcontainer.clone()));
        }
        let subcontainer = self.destination.create_subcontainer(container, slug)?;
        info!(key, destination_id = %subcontainer.id, "created subcontainer");
        self.progress.subcontainers.insert(key, subcontainer.clone());
        self.report.containers_created += 1;
        Ok(Some(subcontainer))
    }

    fn rewrite_media(&mut self, html: &str, page: Option<&PageRef>) -> Result<Rewritten> {
        let style = self.source.url_style();
        let Self {
            source,
            destination,
            progress,
            report,
            ..
        } = self;
        rewrite::rewrite_media::<_, anyhow::Error>(html, style, |media_ref| {
            let resolution = media::resolve(
                &mut **source,
                &mut **destination,
                &mut **progress,
                media_ref,
                page,
            )?;
            match &resolution {
                MediaResolution::Cached(_) => report.media_reused += 1,
                MediaResolution::Uploaded(_) => report.media_uploaded += 1,
                MediaResolution::Deferred => {}
            }
            Ok(resolution.into_reference())
        })
    }

    fn rewrite_links(&self, html: &str) -> Rewritten {
        let destination = &*self.destination;
        let progress = &*self.progress;
        rewrite::rewrite_links(
            html,
            self.source.url_style(),
            |value| progress.media.values().any(|reference| reference == value),
            |page_id| destination.address_for(page_id, progress),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::dokuwiki::tests::MockWiki;

    /// Records every mutating call; ids are handed out sequentially from 1.
    #[derive(Default)]
    pub(crate) struct MockDestination {
        pub flat: bool,
        pub media_needs_page: bool,
        pub fail_on: Option<String>,
        pub calls: Vec<String>,
        pub contents: BTreeMap<String, String>,
        pub uploaded_bytes: Vec<Vec<u8>>,
        pub next_id: usize,
    }

    impl MockDestination {
        fn record(&mut self, call: String) -> Result<()> {
            if let Some(fail_on) = &self.fail_on
                && call.starts_with(fail_on.as_str())
            {
                bail!("mock failure on {call}");
            }
            self.calls.push(call);
            Ok(())
        }

        fn allocate_id(&mut self) -> String {
            self.next_id += 1;
            self.next_id.to_string()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls
                .iter()
                .filter(|call| call.starts_with(prefix))
                .count()
        }
    }

    impl Destination for MockDestination {
        fn kind(&self) -> DestinationKind {
            DestinationKind::BookStack
        }

        fn layout(&self) -> PageLayout {
            if self.flat {
                PageLayout::Flat
            } else {
                PageLayout::Hierarchical
            }
        }

        fn page_key(&self, page_id: &str, path: &PagePath) -> String {
            if self.flat {
                page_id.to_string()
            } else {
                path.to_string()
            }
        }

        fn create_container(&mut self, slug: &str) -> Result<ContainerRef> {
            self.record(format!("create_container:{slug}"))?;
            Ok(ContainerRef {
                id: self.allocate_id(),
                slug: slug.to_string(),
                name: slug.to_string(),
            })
        }

        fn create_subcontainer(
            &mut self,
            container: &ContainerRef,
            slug: &str,
        ) -> Result<ContainerRef> {
            self.record(format!("create_subcontainer:{}/{slug}", container.slug))?;
            Ok(ContainerRef {
                id: self.allocate_id(),
                slug: slug.to_string(),
                name: slug.to_string(),
            })
        }

        fn create_page(&mut self, page: &NewPage<'_>) -> Result<PageRef> {
            let key = self.page_key(page.page_id, page.path);
            self.record(format!("create_page:{key}"))?;
            let id = self.allocate_id();
            self.contents.insert(id.clone(), page.content.to_string());
            Ok(PageRef {
                id,
                slug: Some(page.path.leaf.clone()),
            })
        }

        fn update_page(&mut self, page: &PageRef, content: &str) -> Result<()> {
            self.record(format!("update_page:{}", page.id))?;
            self.contents.insert(page.id.clone(), content.to_string());
            Ok(())
        }

        fn media_needs_page(&self) -> bool {
            self.media_needs_page
        }

        fn upload_media(
            &mut self,
            upload: MediaUpload<'_>,
            page: Option<&PageRef>,
            _progress: &mut MigrationProgress,
        ) -> Result<String> {
            let call = match page {
                Some(page) => format!("upload_media:{}@{}", upload.media.id, page.id),
                None => format!("upload_media:{}", upload.media.id),
            };
            self.record(call)?;
            self.uploaded_bytes.push(upload.bytes);
            Ok(format!("/uploads/{}", upload.media.id))
        }

        fn address_for(&self, page_id: &str, progress: &MigrationProgress) -> Option<String> {
            let key = if self.flat {
                page_id.to_string()
            } else {
                map_page_id(page_id).ok()?.to_string()
            };
            progress
                .page(&key)
                .map(|migrated| format!("/pages/{}", migrated.page.id))
        }

        fn request_count(&self) -> usize {
            self.calls.len()
        }
    }

    fn run(
        source: &mut MockWiki,
        destination: &mut MockDestination,
        progress: &mut MigrationProgress,
    ) -> Result<MigrationReport> {
        Migrator::new(source, destination, progress, SequencerOptions::default()).migrate()
    }

    #[test]
    fn history_is_replayed_in_revision_order() {
        let mut source = MockWiki::default()
            .with_page("a:b", 10, &[5, 10])
            .with_page("a:b:c", 7, &[]);
        let mut destination = MockDestination::default();
        let mut progress = MigrationProgress::default();

        let report = run(&mut source, &mut destination, &mut progress).expect("migrate");

        assert_eq!(
            source.fetched_html,
            vec![
                ("a:b".to_string(), 5),
                ("a:b:c".to_string(), 0),
                ("a:b".to_string(), 10),
            ]
        );
        assert_eq!(
            destination.calls,
            vec![
                "create_container:a",
                "create_page:a/b",
                "create_subcontainer:a/b",
                "create_page:a/b/c",
                "update_page:2",
            ]
        );
        assert_eq!(progress.page("a/b").expect("a:b").latest_revision, 10);
        assert_eq!(progress.page("a/b/c").expect("a:b:c").latest_revision, 7);
        assert_eq!(report.units, 3);
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.containers_created, 2);
    }

    #[test]
    fn second_run_makes_no_destination_calls() {
        let mut source = MockWiki::default()
            .with_page("wiki:start", 20, &[10, 20])
            .with_page("wiki:syntax", 15, &[15]);
        let mut destination = MockDestination::default();
        let mut progress = MigrationProgress::default();
        run(&mut source, &mut destination, &mut progress).expect("first run");
        let after_first = progress.clone();
        destination.calls.clear();
        source.fetched_html.clear();

        let report = run(&mut source, &mut destination, &mut progress).expect("second run");

        assert!(destination.calls.is_empty());
        assert!(source.fetched_html.is_empty());
        assert_eq!(report.skipped, 3);
        assert_eq!(progress, after_first);
    }

    #[test]
    fn older_revisions_never_lower_the_ledger() {
        let mut source = MockWiki::default().with_page("wiki:start", 30, &[10, 30]);
        let mut destination = MockDestination::default();
        let mut progress = MigrationProgress::default();
        progress.insert_page(
            "wiki/start",
            PageRef {
                id: "9".to_string(),
                slug: None,
            },
            20,
        );

        let report = run(&mut source, &mut destination, &mut progress).expect("migrate");

        assert_eq!(report.skipped, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(destination.calls, vec!["update_page:9"]);
        assert_eq!(progress.page("wiki/start").expect("page").latest_revision, 30);
    }

    #[test]
    fn containers_are_created_once() {
        let mut source = MockWiki::default()
            .with_page("team:a", 1, &[1])
            .with_page("team:b", 2, &[2])
            .with_page("team:docs:c", 3, &[3])
            .with_page("team:docs:d", 4, &[4]);
        let mut destination = MockDestination::default();
        let mut progress = MigrationProgress::default();

        run(&mut source, &mut destination, &mut progress).expect("migrate");

        assert_eq!(destination.count("create_container:"), 1);
        assert_eq!(destination.count("create_subcontainer:"), 1);
        assert_eq!(destination.count("create_page:"), 4);
    }

    #[test]
    fn known_containers_are_not_recreated() {
        let mut source = MockWiki::default().with_page("team:a", 1, &[1]);
        let mut destination = MockDestination::default();
        let mut progress = MigrationProgress::default();
        progress.containers.insert(
            "team".to_string(),
            ContainerRef {
                id: "77".to_string(),
                slug: "team".to_string(),
                name: "Team".to_string(),
            },
        );

        run(&mut source, &mut destination, &mut progress).expect("migrate");
        assert_eq!(destination.calls, vec!["create_page:team/a"]);
    }

    #[test]
    fn shared_media_is_uploaded_once() {
        let image = r#"<p><img src="/lib/exe/fetch.php?media=shared:logo.png"></p>"#;
        let mut source = MockWiki::default()
            .with_page("wiki:one", 1, &[1])
            .with_page("wiki:two", 2, &[2])
            .with_html("wiki:one", 1, image)
            .with_html("wiki:two", 2, image);
        let mut destination = MockDestination {
            flat: true,
            ..MockDestination::default()
        };
        let mut progress = MigrationProgress::default();

        let report = run(&mut source, &mut destination, &mut progress).expect("migrate");

        assert_eq!(destination.count("upload_media:"), 1);
        assert_eq!(report.media_uploaded, 1);
        assert_eq!(report.media_reused, 1);
        for content in destination.contents.values() {
            assert!(content.contains(r#"src="/uploads/shared:logo.png""#));
        }
    }

    #[test]
    fn page_bound_media_is_attached_after_creation() {
        let mut source = MockWiki::default()
            .with_page("team:intro", 1, &[1])
            .with_html(
                "team:intro",
                1,
                r#"<p><img src="/lib/exe/fetch.php?media=team:diagram.png"></p>"#,
            );
        let mut destination = MockDestination {
            media_needs_page: true,
            ..MockDestination::default()
        };
        let mut progress = MigrationProgress::default();

        run(&mut source, &mut destination, &mut progress).expect("migrate");

        assert_eq!(
            destination.calls,
            vec![
                "create_container:team",
                "create_page:team/intro",
                "upload_media:team:diagram.png@2",
                "update_page:2",
            ]
        );
        let content = destination.contents.get("2").expect("content");
        assert!(content.contains(r#"src="/uploads/team:diagram.png""#));
        assert_eq!(progress.page("team/intro").expect("page").latest_revision, 1);
    }

    #[test]
    fn failed_follow_up_update_is_not_repeated_on_resume() {
        let mut source = MockWiki::default()
            .with_page("team:intro", 1, &[1])
            .with_html(
                "team:intro",
                1,
                r#"<p><img src="/lib/exe/fetch.php?media=team:diagram.png"></p>"#,
            );
        let mut destination = MockDestination {
            media_needs_page: true,
            fail_on: Some("update_page:".to_string()),
            ..MockDestination::default()
        };
        let mut progress = MigrationProgress::default();

        let error = run(&mut source, &mut destination, &mut progress).expect_err("must fail");
        assert!(format!("{error:#}").contains("team:intro"));
        assert_eq!(progress.page("team/intro").expect("page").latest_revision, 1);
        assert_eq!(
            progress.media.get("team:diagram.png").map(String::as_str),
            Some("/uploads/team:diagram.png")
        );

        destination.fail_on = None;
        destination.calls.clear();
        let report = run(&mut source, &mut destination, &mut progress).expect("resume");

        assert!(destination.calls.is_empty());
        assert_eq!(report.skipped, 1);
        let content = destination.contents.get("2").expect("content");
        assert!(content.contains(r#"src="/lib/exe/fetch.php?media=team:diagram.png""#));
    }

    #[test]
    fn no_follow_up_update_without_deferred_media() {
        let mut source = MockWiki::default().with_page("team:intro", 1, &[1]);
        let mut destination = MockDestination {
            media_needs_page: true,
            ..MockDestination::default()
        };
        let mut progress = MigrationProgress::default();

        run(&mut source, &mut destination, &mut progress).expect("migrate");
        assert_eq!(destination.count("update_page:"), 0);
    }

    #[test]
    fn links_resolve_only_to_already_migrated_pages() {
        let mut source = MockWiki::default()
            .with_page("docs:first", 1, &[1])
            .with_page("docs:second", 2, &[2])
            .with_html(
                "docs:first",
                1,
                r#"<a href="/doku.php?id=docs:second">next</a>"#,
            )
            .with_html(
                "docs:second",
                2,
                r##"<a href="/doku.php?id=docs:first#intro">back</a>"##,
            );
        let mut destination = MockDestination {
            flat: true,
            ..MockDestination::default()
        };
        let mut progress = MigrationProgress::default();

        run(&mut source, &mut destination, &mut progress).expect("migrate");

        let first = destination.contents.get("1").expect("first");
        let second = destination.contents.get("2").expect("second");
        assert!(first.contains(r#"href="/doku.php?id=docs:second""#));
        assert!(second.contains(r##"href="/pages/1#intro""##));
    }

    #[test]
    fn failure_keeps_progress_of_completed_units() {
        let mut source = MockWiki::default()
            .with_page("a:b", 1, &[1])
            .with_page("a:c", 2, &[2]);
        let mut destination = MockDestination {
            fail_on: Some("create_page:a/c".to_string()),
            ..MockDestination::default()
        };
        let mut progress = MigrationProgress::default();

        let mut migrator = Migrator::new(
            &mut source,
            &mut destination,
            &mut progress,
            SequencerOptions::default(),
        );
        let error = migrator.migrate().expect_err("must fail");
        assert!(format!("{error:#}").contains("a:c"));
        assert_eq!(migrator.report().created, 1);
        assert!(migrator.report().destination_requests > 0);

        assert!(progress.page("a/b").is_some());
        assert!(progress.page("a/c").is_none());
        assert!(progress.containers.contains_key("a"));
    }

    #[test]
    fn invalid_identifiers_abort_the_run() {
        let mut source = MockWiki::default().with_page("", 1, &[1]);
        let mut destination = MockDestination::default();
        let mut progress = MigrationProgress::default();

        let error = run(&mut source, &mut destination, &mut progress).expect_err("must fail");
        assert!(format!("{error:#}").contains("invalid page identifier"));
        assert!(destination.calls.is_empty());
    }
}
