use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use geo::{Point, Rect};
use tracing_subscriber::EnvFilter;

use photomap::{
    list::when, visit_images, Cache, Capturer, Config, Coordinates, Enricher, ExifLocation,
    FileCamera, FixedLocation, Geocoder, ListView, LocalFiles, LocationProvider, MapSurface,
    MapView, MarkerHandle, MarkerSpec, Nominatim, PhotoRecord, PhotoRef, PhotoStore,
};

/// Keep a photo collection in sync with a list and a map
#[derive(Parser)]
struct Cli {
    #[command(flatten)]
    config: Config,
    #[arg(short, long, action, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the collection, newest first
    List {
        /// Only liked photos
        #[arg(short, long, action)]
        favorites: bool,
    },
    /// Add one image to the collection
    Capture {
        image: PathBuf,
        /// Latitude where the photo was taken (defaults to the image's GPS tags)
        #[arg(long, allow_negative_numbers = true, requires = "lon")]
        lat: Option<f64>,
        /// Longitude where the photo was taken
        #[arg(long, allow_negative_numbers = true, requires = "lat")]
        lon: Option<f64>,
    },
    /// Add every JPEG under a directory
    Import {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Toggle the like on a photo
    Like { id: String },
    /// Remove a photo and its file
    Delete {
        #[arg(required_unless_present = "position")]
        id: Option<String>,
        /// Position in the list instead of an id
        #[arg(short, long, conflicts_with = "id")]
        position: Option<usize>,
    },
    /// Look up place names for photos that have coordinates but no place
    Enrich,
    /// Render the collection's markers and print the fitted bounds
    Map,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(args.verbose);

    match run(args.config, args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: Config, command: Command) -> photomap::Result<()> {
    let kv = Arc::new(Cache::new(&config.store_dir())?);
    let files = Arc::new(LocalFiles::new(&config.photos_dir())?);
    let store = Arc::new(PhotoStore::new(kv, files, config.display_mode));
    store.load().await?;

    let geocoder: Arc<dyn Geocoder> = Arc::new(
        Nominatim::new(
            &config.geocode_url,
            &config.user_agent,
            config.geocode_timeout(),
        )?
        .with_cache(Cache::new(&config.geocode_cache_dir())?),
    );
    let capturer = |location: Arc<dyn LocationProvider>| {
        Capturer::new(
            Arc::clone(&store),
            location,
            Arc::clone(&geocoder),
            config.location_timeout(),
            config.geocode_timeout(),
        )
    };

    match command {
        Command::List { favorites } => {
            let view = ListView::attach(&store);
            let photos = if favorites {
                view.favorites()
            } else {
                view.photos().to_vec()
            };
            for photo in photos.iter() {
                print_photo(photo);
            }
        }
        Command::Capture { image, lat, lon } => {
            let location: Arc<dyn LocationProvider> = match (lat, lon) {
                (Some(lat), Some(lon)) => Arc::new(FixedLocation(Some(Coordinates::new(lat, lon)))),
                _ => Arc::new(ExifLocation),
            };
            if let Some(record) = capturer(location)
                .capture_new(&FileCamera::new(&image))
                .await?
            {
                print_photo(&record);
            }
        }
        Command::Import { dir } => {
            let capturer = capturer(Arc::new(ExifLocation));
            let mut added = 0;
            for path in visit_images(&dir)? {
                match capturer.capture_new(&FileCamera::new(&path)).await {
                    Ok(Some(record)) => {
                        added += 1;
                        print_photo(&record);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping image"),
                }
            }
            tracing::info!(count = added, "import finished");
        }
        Command::Like { id } => match store.toggle_like(&id).await? {
            Some(record) => print_photo(&record),
            None => eprintln!("No photo with id {}", id),
        },
        Command::Delete { id, position } => {
            let target = match (&id, position) {
                (Some(id), _) => PhotoRef::Id(id.as_str()),
                (None, Some(position)) => PhotoRef::Position(position),
                (None, None) => return Ok(()),
            };
            match store.remove(target).await? {
                Some(record) => println!("Removed {}", record.id()),
                None => eprintln!("No such photo"),
            }
        }
        Command::Enrich => {
            let enricher = Enricher::new(
                Arc::clone(&store),
                Arc::clone(&geocoder),
                config.geocode_timeout(),
            );
            let queued = enricher.enrich_pending();
            enricher.wait_idle().await;
            let missing = store.snapshot().iter().filter(|p| p.needs_place()).count();
            println!("Looked up {} photos, {} still without a place", queued, missing);
        }
        Command::Map => {
            let mut view = MapView::new(ConsoleMap::default(), config.map_options());
            view.enter(&store);
            view.with(|reconciler| {
                println!("{} markers", reconciler.marker_count());
            });
            view.teardown();
        }
    }
    Ok(())
}

fn print_photo(photo: &PhotoRecord) {
    let location = match (photo.place(), photo.coordinates()) {
        (Some(place), _) => place.to_string(),
        (None, Some(at)) => format!("{:.5},{:.5}", at.lat, at.lon),
        (None, None) => "-".to_string(),
    };
    println!(
        "{}\t{}\t{}{}\t{}\t{}",
        photo.id(),
        when(photo.created_at()),
        if photo.liked() { "♥" } else { "♡" },
        photo.like_count(),
        location,
        photo.file_path()
    );
}

/// Map surface that prints what a real map widget would draw.
#[derive(Default)]
struct ConsoleMap {
    next: u64,
}

impl MapSurface for ConsoleMap {
    fn create(&mut self, center: Point<f64>, zoom: u8) {
        println!("map centre {:.5},{:.5} zoom {}", center.y(), center.x(), zoom);
    }

    fn add_marker(&mut self, marker: &MarkerSpec<'_>) -> MarkerHandle {
        self.next += 1;
        println!(
            "marker {}\t{:.5},{:.5}\t{}",
            marker.id,
            marker.position.y(),
            marker.position.x(),
            when(marker.created_at)
        );
        MarkerHandle(self.next)
    }

    fn remove_marker(&mut self, handle: MarkerHandle) {
        println!("remove marker #{}", handle.0);
    }

    fn fit_bounds(&mut self, bounds: &Rect<f64>, padding: u32) {
        println!(
            "fit {:.5},{:.5} .. {:.5},{:.5} padding {}",
            bounds.min().y,
            bounds.min().x,
            bounds.max().y,
            bounds.max().x,
            padding
        );
    }
}
